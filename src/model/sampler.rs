use log::debug;
use serde::Deserialize;

use crate::utils::constants::{
    NSEC_PER_MSEC,
    strategy::{NL_RATIO, TARGET_LOAD},
};

/// 负载统计方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadTracking {
    /// Per-Entity Load Tracking：启用忙碌检测
    #[default]
    Pelt,
    /// Window-Assisted Load Tracking：启用 hispeed/pl/rtg 调整与平均容量统计
    Walt,
}

/// 调度器特性开关
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerFeatures {
    /// 有可运行的实时任务时直接拉满
    pub rt_max_freq: bool,
    /// 使用 uclamp 约束任务频率
    pub uclamp_task: bool,
    /// WALT 下 pl 按目标负载折算
    pub conservative_pl: bool,
}

impl Default for SamplerFeatures {
    fn default() -> Self {
        Self {
            rt_max_freq: true,
            uclamp_task: false,
            conservative_pl: false,
        }
    }
}

/// 可运行任务请求的利用率钳制范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UclampRange {
    pub min: u64,
    pub max: u64,
}

impl UclampRange {
    fn apply(&self, util: u64) -> u64 {
        util.clamp(self.min, self.max.max(self.min))
    }
}

/// 按调度类拆分的利用率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UtilBreakdown {
    pub cfs: u64,
    pub rt: u64,
    /// DL 任务实测运行时间
    pub dl_util: u64,
    /// DL 任务模型要求的最低带宽
    pub dl_bw: u64,
    /// IRQ + steal
    pub irq: u64,
    pub rt_runnable: bool,
    pub uclamp: Option<UclampRange>,
}

/// WALT 附加负载信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaltLoad {
    /// 最近窗口的新任务负载
    pub nl: u64,
    /// 预测负载
    pub pl: u64,
    /// 当前窗口起点 (ns)
    pub ws: u64,
    pub rtgb_active: bool,
}

/// 单次调度事件携带的 CPU 采样
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSample {
    pub util: UtilBreakdown,
    /// CPU 最大容量
    pub max_capacity: u64,
    pub walt: WaltLoad,
    /// 累计进入空闲的次数，用于判断 CPU 是否一直忙碌
    pub idle_calls: Option<u64>,
}

/// 在利用率上增加 25% 的 DVFS 余量
pub fn apply_dvfs_headroom(util: u64) -> u64 {
    util + (util >> 2)
}

/// 任务时钟不含 IRQ 时间，按非 IRQ 时间占比缩放
pub fn scale_irq_capacity(util: u64, irq: u64, max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    util * max.saturating_sub(irq) / max
}

/// 计算用于调频的有效利用率
pub fn effective_cpu_util(sample: &UtilBreakdown, max: u64, features: &SamplerFeatures) -> u64 {
    if features.rt_max_freq && !features.uclamp_task && sample.rt_runnable {
        return max;
    }

    // IRQ/steal 本身已经占满
    let irq = sample.irq;
    if irq >= max {
        return max;
    }

    let mut util = sample.cfs + sample.rt;
    if let Some(clamp) = sample.uclamp
        && clamp.apply(util) < util
    {
        util = clamp.apply(apply_dvfs_headroom(util));
    }

    if util + sample.dl_util >= max {
        return max;
    }

    util = scale_irq_capacity(util, irq, max);
    util += apply_dvfs_headroom(irq);
    util += apply_dvfs_headroom(sample.dl_bw);

    util.min(max)
}

/// 频率换算为容量刻度上的利用率
pub fn freq_to_util(max_capacity: u64, freq: u32, cpuinfo_max: u32) -> u64 {
    if cpuinfo_max == 0 {
        return 0;
    }
    max_capacity * u64::from(freq) / u64::from(cpuinfo_max)
}

/// hispeed / rtg 频率对应的目标利用率
pub fn target_util(max_capacity: u64, freq: u32, cpuinfo_max: u32) -> u64 {
    freq_to_util(max_capacity, freq, cpuinfo_max) * TARGET_LOAD / 100
}

/// WALT 调整所需的策略级上下文
#[derive(Debug, Clone, Copy)]
pub struct WaltContext {
    pub avg_cap: u64,
    pub hispeed_util: u64,
    pub rtg_boost_util: u64,
    pub hispeed_load: u32,
    pub pl_enabled: bool,
    pub conservative_pl: bool,
}

/// 按 WALT 信号抬高利用率
///
/// `cpu_util` 为该 CPU 上次采样的原始利用率，`is_migration` 表示本次
/// 更新由跨集群迁移触发。
pub fn walt_adjust(
    ctx: &WaltContext,
    cpu_util: u64,
    walt: &WaltLoad,
    is_migration: bool,
    util: &mut u64,
    max: &mut u64,
) {
    if walt.rtgb_active {
        *util = (*util).max(ctx.rtg_boost_util);
    }

    let is_hiload = cpu_util >= ctx.avg_cap * u64::from(ctx.hispeed_load) / 100;

    if is_hiload && !is_migration {
        *util = (*util).max(ctx.hispeed_util);
    }

    if is_hiload && walt.nl >= cpu_util * NL_RATIO / 100 {
        *util = *max;
    }

    if ctx.pl_enabled {
        let pl = if ctx.conservative_pl {
            walt.pl * TARGET_LOAD / 100
        } else {
            walt.pl
        };
        *util = (*util).max(pl);
    }
}

/// 按 WALT 窗口统计平均运行频率
#[derive(Debug, Clone, Default)]
pub struct CycleTracker {
    last_ws: u64,
    curr_cycles: u64,
    last_cyc_update_time: u64,
    avg_cap: u64,
}

impl CycleTracker {
    pub fn avg_cap(&self) -> u64 {
        self.avg_cap
    }

    /// 累计到 `upto` 为止在 `prev_freq` 下运行的周期数 (KHz * ms)
    pub fn track_cycles(&mut self, prev_freq: u32, upto: u64, window_ns: u64) {
        let next_ws = self.last_ws + window_ns;
        let upto = upto.min(next_ws);
        let delta_ns = upto.saturating_sub(self.last_cyc_update_time);
        self.curr_cycles += delta_ns * u64::from(prev_freq) / NSEC_PER_MSEC;
        self.last_cyc_update_time = upto;
    }

    /// 新窗口开始时结算上一窗口的平均容量
    pub fn calc_avg_cap(
        &mut self,
        curr_ws: u64,
        prev_freq: u32,
        window_ns: u64,
        max_capacity: u64,
        cpuinfo_max: u32,
    ) {
        if curr_ws <= self.last_ws || window_ns == 0 {
            return;
        }

        let avg_freq = if curr_ws > self.last_ws + window_ns {
            // 跳过了若干窗口，重新开始统计
            self.last_cyc_update_time = curr_ws;
            u64::from(prev_freq)
        } else {
            self.track_cycles(prev_freq, curr_ws, window_ns);
            self.curr_cycles / (window_ns / NSEC_PER_MSEC).max(1)
        };

        let avg_freq = u32::try_from(avg_freq).unwrap_or(u32::MAX);
        self.avg_cap = freq_to_util(max_capacity, avg_freq, cpuinfo_max);
        self.curr_cycles = 0;
        self.last_ws = curr_ws;
        debug!("avg_cap updated: ws={curr_ws} avg_freq={avg_freq} avg_cap={}", self.avg_cap);
    }
}
