/// Frame-Aware Governor 常量定义
pub const NOTES: &str = "Frame-Aware CPU Frequency Governor";
pub const AUTHOR: &str = "Author: walika @CoolApk, Tools-cx-app @GitHub";
pub const SPECIAL: &str = "Special Thanks: LibXZR (hwui_mon) and the schedutil authors";
pub const VERSION: &str = "Version: v1.0.0";

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;

/// 调度器容量刻度
pub const SCHED_CAPACITY_SCALE: u64 = 1024;

/// 调频算法常量
pub mod strategy {
    /// 目标帧耗时 (us)，同时也是卡顿判定阈值
    pub const TARGET_FRAME_TIME_US: u32 = 4000;
    /// 帧加速持续 12 个 120Hz 帧 (~100ms)
    pub const FRAME_BOOST_FRAMES: u64 = 12;
    pub const FRAME_INTERVAL_120HZ_US: u64 = 8333;
    /// 负载超过容量的该比例时直接拉满
    pub const FRAME_BOOST_MAX_LOAD_PCT: u64 = 80;
    /// 负载超过容量的该比例时向上取整到硬件档位
    pub const FRAME_BOOST_STEP_LOAD_PCT: u64 = 65;
    /// 计算频率距离低档位不足该比例时选择低档位
    pub const STEP_DOWN_MARGIN_PCT: u64 = 20;
    /// hispeed / rtg 频率换算利用率时的目标负载
    pub const TARGET_LOAD: u64 = 77;
    /// nl 占 util 的比例达到该值时视为高负载
    pub const NL_RATIO: u64 = 75;
    /// 慢速切换线程的实时优先级 (MAX_USER_RT_PRIO / 2)
    pub const WORKER_RT_PRIORITY: i32 = 50;
    pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 8;
    pub const DEFAULT_WALT_WINDOW_NS: u64 = 20_000_000;
}

/// 各集群的默认可调参数
pub mod defaults {
    pub const UP_RATE_LIMIT_US_LP: u32 = 1300;
    pub const UP_RATE_LIMIT_US_HP: u32 = 2520;
    pub const UP_RATE_LIMIT_US_PR: u32 = 2170;
    pub const DOWN_RATE_LIMIT_US: u32 = 1000;

    pub const FRAME_FREQ_LP: u32 = 1_708_800;
    pub const FRAME_FREQ_HP: u32 = 1_862_400;
    pub const FRAME_FREQ_PR: u32 = 2_265_600;

    pub const EFFICIENT_FREQ_LP: &[u32] = &[1_708_800];
    pub const EFFICIENT_FREQ_HP: &[u32] = &[1_670_400];
    pub const EFFICIENT_FREQ_PR: &[u32] = &[1_862_400];

    pub const UP_DELAY_MS_LP: &[u64] = &[2560];
    pub const UP_DELAY_MS_HP: &[u64] = &[3670];
    pub const UP_DELAY_MS_PR: &[u64] = &[3240];

    pub const RTG_BOOST_FREQ_LP: u32 = 979_200;
    pub const RTG_BOOST_FREQ_HP: u32 = 940_800;
    pub const RTG_BOOST_FREQ_PR: u32 = 1_075_200;

    pub const HISPEED_LOAD_LP: u32 = 77;
    pub const HISPEED_LOAD_HP: u32 = 67;
    pub const HISPEED_LOAD_PR: u32 = 65;

    pub const HISPEED_FREQ_LP: u32 = 1_344_000;
    pub const HISPEED_FREQ_HP: u32 = 940_800;
    pub const HISPEED_FREQ_PR: u32 = 1_075_200;

    pub const PL: bool = true;
}
