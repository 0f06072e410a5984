pub mod actuator;
pub mod frame_boost;
pub mod frequency_table;
pub mod governor;
pub mod policy;
pub mod rate_limiter;
pub mod resolver;
pub mod sampler;
pub mod tunables;
