use std::collections::VecDeque;

use log::debug;

use crate::{
    model::frequency_table::{FrequencyTable, Relation},
    utils::constants::{
        NSEC_PER_USEC,
        strategy::{
            FRAME_BOOST_FRAMES, FRAME_BOOST_MAX_LOAD_PCT, FRAME_BOOST_STEP_LOAD_PCT,
            FRAME_INTERVAL_120HZ_US, TARGET_FRAME_TIME_US,
        },
    },
};

/// 一次帧加速请求，创建后不再修改
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBoost {
    freq: u32,
    expiration: u64,
}

impl FrameBoost {
    pub fn new(freq: u32, expiration: u64) -> Self {
        Self { freq, expiration }
    }

    pub fn freq(&self) -> u32 {
        self.freq
    }

    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration <= now
    }
}

/// 按到达顺序保存的帧加速队列
///
/// 加速时长固定，到达顺序即过期顺序，所以只需要从队头清理。
#[derive(Debug, Clone, Default)]
pub struct FrameBoostQueue {
    boosts: VecDeque<FrameBoost>,
}

impl FrameBoostQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, boost: FrameBoost) {
        self.boosts.push_back(boost);
    }

    /// 清理队头已过期的请求，返回清理数量
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.boosts.len();
        while self.boosts.front().is_some_and(|b| b.is_expired(now)) {
            self.boosts.pop_front();
        }
        before - self.boosts.len()
    }

    /// 当前最大加速频率，队列为空时返回 0
    pub fn max_freq(&self) -> u32 {
        self.boosts.iter().map(FrameBoost::freq).max().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.boosts.clear();
    }

    pub fn len(&self) -> usize {
        self.boosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boosts.is_empty()
    }
}

/// 计算帧加速所需的策略信息
#[derive(Debug, Clone, Copy)]
pub struct BoostContext<'a> {
    pub cur_freq: u32,
    pub cpuinfo_max: u32,
    pub frame_freq: u32,
    /// 策略首个 CPU 的当前利用率
    pub load: u64,
    pub capacity: u64,
    pub table: &'a FrequencyTable,
}

/// 帧加速持续时间 (ns)
pub fn boost_duration_ns() -> u64 {
    FRAME_BOOST_FRAMES * FRAME_INTERVAL_120HZ_US * NSEC_PER_USEC
}

/// 根据超时帧耗时计算加速请求
pub fn calc_frame_boost(ctx: &BoostContext<'_>, frame_time_us: u32, now: u64) -> FrameBoost {
    let raw = u64::from(ctx.cur_freq) * u64::from(frame_time_us) / u64::from(TARGET_FRAME_TIME_US);
    let mut freq = u32::try_from(raw).unwrap_or(u32::MAX);

    if freq < ctx.frame_freq {
        freq = ctx.frame_freq;
    } else if freq > ctx.cpuinfo_max {
        freq = ctx.cpuinfo_max;
    }

    let load_pct = ctx.load * 100;
    if load_pct > ctx.capacity * FRAME_BOOST_MAX_LOAD_PCT {
        freq = ctx.cpuinfo_max;
    } else if load_pct > ctx.capacity * FRAME_BOOST_STEP_LOAD_PCT {
        freq = ctx
            .table
            .target(freq, 0, ctx.cpuinfo_max, Relation::Low)
            .unwrap_or(freq);
    } else if freq <= ctx.frame_freq {
        freq = ctx.frame_freq;
    }

    let boost = FrameBoost::new(freq, now + boost_duration_ns());
    debug!(
        "frame boost: frame_time={frame_time_us}us cur={} load={}/{} -> freq={} until {}",
        ctx.cur_freq,
        ctx.load,
        ctx.capacity,
        boost.freq(),
        boost.expiration()
    );
    boost
}

/// 帧耗时滑动平均，只用于调试输出，不参与调频决策
#[derive(Debug, Clone, Default)]
pub struct FrameTimeStats {
    avg_frame_time_us: u64,
    frame_count: u64,
}

impl FrameTimeStats {
    pub fn record(&mut self, frame_time_us: u32) -> u64 {
        let n = self.frame_count;
        self.avg_frame_time_us = (self.avg_frame_time_us * n + u64::from(frame_time_us)) / (n + 1);
        self.frame_count += 1;
        self.avg_frame_time_us
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}
