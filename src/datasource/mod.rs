pub mod config_parser;
pub mod file_path;
pub mod frame_monitor;
pub mod load_monitor;
pub mod node_monitor;
pub mod policy_table;
pub mod sysfs_driver;
