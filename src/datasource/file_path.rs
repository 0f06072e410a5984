// Thread names
pub const MAIN_THREAD: &str = "LoadSampler";
pub const CONF_THREAD: &str = "ConfigWatcher";
pub const FRAME_THREAD: &str = "FrameMonitor";
pub const LOG_LEVEL_THREAD: &str = "LogLevelMonitor";

// File paths
pub const CPUFREQ_ROOT: &str = "/sys/devices/system/cpu/cpufreq";
pub const PROC_STAT: &str = "/proc/stat";
pub const CONFIG_FILE: &str = "/data/adb/fa_governor/config.toml";
pub const FRAME_TIME_PIPE: &str = "/data/adb/fa_governor/frame_time";
pub const LOG_LEVEL_PATH: &str = "/data/adb/fa_governor/log/log_level";

// cpufreq policy nodes
pub const AVAILABLE_FREQS: &str = "scaling_available_frequencies";
pub const RELATED_CPUS: &str = "related_cpus";
pub const AFFECTED_CPUS: &str = "affected_cpus";
pub const CPUINFO_MIN: &str = "cpuinfo_min_freq";
pub const CPUINFO_MAX: &str = "cpuinfo_max_freq";
pub const SCALING_MIN: &str = "scaling_min_freq";
pub const SCALING_MAX: &str = "scaling_max_freq";
pub const SCALING_CUR: &str = "scaling_cur_freq";
pub const SCALING_GOVERNOR: &str = "scaling_governor";
pub const SCALING_SETSPEED: &str = "scaling_setspeed";
pub const USERSPACE_GOVERNOR: &str = "userspace";
