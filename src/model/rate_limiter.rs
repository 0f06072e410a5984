use bitflags::bitflags;
use log::debug;

bitflags! {
    /// 调度器触发更新时携带的标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFlags: u32 {
        /// 本次只记录采样，不做调频决策
        const CONTINUE = 1 << 0;
        /// 跳过速率限制，立即重新计算并提交
        const SKIP_LIMITS = 1 << 1;
        /// 由预测负载 (pl) 触发
        const PL = 1 << 2;
        /// 由跨集群迁移触发
        const INTERCLUSTER_MIG = 1 << 3;
    }
}

/// 升降频速率限制状态
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    last_freq_update_time: u64,
    next_freq: u32,
    cached_raw_freq: u32,
    prev_cached_raw_freq: u32,
    up_rate_delay_ns: u64,
    down_rate_delay_ns: u64,
    min_rate_limit_ns: u64,
    limits_changed: bool,
    need_freq_update: bool,
}

impl RateLimiter {
    pub fn new(up_rate_delay_ns: u64, down_rate_delay_ns: u64) -> Self {
        let mut limiter = Self::default();
        limiter.set_delays(up_rate_delay_ns, down_rate_delay_ns);
        limiter
    }

    pub fn set_delays(&mut self, up_rate_delay_ns: u64, down_rate_delay_ns: u64) {
        self.up_rate_delay_ns = up_rate_delay_ns;
        self.down_rate_delay_ns = down_rate_delay_ns;
        self.min_rate_limit_ns = up_rate_delay_ns.min(down_rate_delay_ns);
        debug!("rate limits: up={up_rate_delay_ns}ns down={down_rate_delay_ns}ns");
    }

    /// 策略启动时清空所有状态，只保留延迟设置
    pub fn reset(&mut self) {
        *self = Self::new(self.up_rate_delay_ns, self.down_rate_delay_ns);
    }

    pub fn next_freq(&self) -> u32 {
        self.next_freq
    }

    pub fn last_freq_update_time(&self) -> u64 {
        self.last_freq_update_time
    }

    pub fn cached_raw_freq(&self) -> u32 {
        self.cached_raw_freq
    }

    pub fn min_rate_limit_ns(&self) -> u64 {
        self.min_rate_limit_ns
    }

    pub fn need_freq_update(&self) -> bool {
        self.need_freq_update
    }

    /// 限制条件变化 (limits 回调、DL 带宽上升) 后强制下一次重新计算
    pub fn mark_limits_changed(&mut self) {
        self.limits_changed = true;
    }

    /// 是否需要重新计算目标频率
    pub fn should_update(&mut self, time: u64, flags: UpdateFlags) -> bool {
        if self.limits_changed {
            self.limits_changed = false;
            self.need_freq_update = true;
            return true;
        }

        if flags.contains(UpdateFlags::SKIP_LIMITS) {
            return true;
        }

        time.saturating_sub(self.last_freq_update_time) >= self.min_rate_limit_ns
    }

    /// 根据变化方向判断是否仍处于限制时间内
    pub fn is_rate_limited(&self, time: u64, next_freq: u32, flags: UpdateFlags) -> bool {
        if flags.contains(UpdateFlags::SKIP_LIMITS) {
            return false;
        }

        let delta_ns = time.saturating_sub(self.last_freq_update_time);

        if next_freq > self.next_freq && delta_ns < self.up_rate_delay_ns {
            return true;
        }

        next_freq < self.next_freq && delta_ns < self.down_rate_delay_ns
    }

    /// 尝试记录新的目标频率，返回是否需要提交到硬件
    pub fn update_next_freq(&mut self, time: u64, next_freq: u32, flags: UpdateFlags) -> bool {
        if self.next_freq == next_freq {
            return false;
        }

        if self.is_rate_limited(time, next_freq, flags) {
            debug!(
                "rate limited: {} -> {next_freq} after {}ns",
                self.next_freq,
                time.saturating_sub(self.last_freq_update_time)
            );
            self.restore_cached_raw();
            return false;
        }

        self.next_freq = next_freq;
        self.last_freq_update_time = self.last_freq_update_time.max(time);
        true
    }

    /// 计算出的原始频率与缓存相同且无需强制更新时返回 false
    pub fn cache_raw_freq(&mut self, raw_freq: u32) -> bool {
        if raw_freq == self.cached_raw_freq && !self.need_freq_update {
            return false;
        }

        self.need_freq_update = false;
        self.prev_cached_raw_freq = self.cached_raw_freq;
        self.cached_raw_freq = raw_freq;
        true
    }

    /// 目标频率未被采用时恢复上一次的原始频率缓存
    pub fn restore_cached_raw(&mut self) {
        self.cached_raw_freq = self.prev_cached_raw_freq;
    }
}
