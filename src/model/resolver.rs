use log::debug;

use crate::{
    model::{
        frame_boost::FrameBoostQueue,
        frequency_table::Relation,
        policy::CpufreqPolicy,
        rate_limiter::RateLimiter,
    },
    utils::constants::strategy::STEP_DOWN_MARGIN_PCT,
};

/// 一次频率解析的输入
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest {
    pub util: u64,
    pub max: u64,
    pub time: u64,
    pub frame_aware: bool,
    pub frame_freq: u32,
}

/// next_freq = 1.25 * freq * util / max，使 80% 负载正好对应基准频率
pub fn map_util_freq(util: u64, freq: u32, max: u64) -> u32 {
    if max == 0 {
        return freq;
    }
    let freq = u64::from(freq);
    let raw = (freq + (freq >> 2)) * util / max;
    u32::try_from(raw).unwrap_or(u32::MAX)
}

/// 计算策略的下一个目标频率，结果总是频率表中的一项
///
/// 调用方需持有策略的更新锁。
pub fn get_next_freq(
    policy: &CpufreqPolicy,
    limiter: &mut RateLimiter,
    boosts: &mut FrameBoostQueue,
    req: &ResolveRequest,
) -> u32 {
    let expired = boosts.expire(req.time);
    if expired > 0 {
        debug!("policy{}: {expired} frame boosts expired", policy.id());
    }

    let boost = if req.frame_aware { boosts.max_freq() } else { 0 };

    let raw = if boost > 0 {
        boost
    } else {
        let mut base = if policy.is_freq_invariant() {
            policy.get_cpuinfo_max()
        } else {
            policy.get_cur()
        };
        if req.frame_aware {
            base = base.min(req.frame_freq);
        }
        map_util_freq(req.util, base, req.max)
    };

    debug!(
        "policy{}: util={} max={} boost={boost} raw={raw}",
        policy.id(),
        req.util,
        req.max
    );

    if !limiter.cache_raw_freq(raw) {
        let pending = limiter.next_freq();
        if pending != 0 {
            return pending;
        }
    }

    // 加速请求是下限，只能向上取档
    if boost > 0 {
        policy.resolve(raw)
    } else {
        select_step(policy, raw)
    }
}

/// 在相邻两个档位间选择：距离低档位不足 20% 时选低档位
pub fn select_step(policy: &CpufreqPolicy, raw: u32) -> u32 {
    let (min, max) = (policy.get_min(), policy.get_max());
    let l_freq = policy.resolve(raw);
    let Some(h_freq) = policy.table().target(raw, min, max, Relation::High) else {
        return l_freq;
    };
    let h_freq = h_freq.clamp(min, max);

    if l_freq <= h_freq || l_freq == min {
        return l_freq;
    }

    let pct = 100 * u64::from(raw.saturating_sub(h_freq)) / u64::from(l_freq - h_freq);
    if pct < STEP_DOWN_MARGIN_PCT {
        h_freq
    } else {
        l_freq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{frame_boost::FrameBoost, frequency_table::FrequencyTable};

    const MAX_FREQ: u32 = 2_000_000;

    fn policy() -> CpufreqPolicy {
        CpufreqPolicy::new(
            0,
            vec![0],
            FrequencyTable::new(vec![300_000, 1_000_000, 1_500_000, 1_600_000, MAX_FREQ]),
        )
        .unwrap()
    }

    fn req(util: u64, time: u64) -> ResolveRequest {
        ResolveRequest {
            util,
            max: 1000,
            time,
            frame_aware: false,
            frame_freq: 1_500_000,
        }
    }

    #[test]
    fn eighty_percent_maps_to_max() {
        let p = policy();
        let mut rl = RateLimiter::default();
        let mut q = FrameBoostQueue::new();
        assert_eq!(map_util_freq(800, MAX_FREQ, 1000), MAX_FREQ);
        assert_eq!(get_next_freq(&p, &mut rl, &mut q, &req(800, 0)), MAX_FREQ);
    }

    #[test]
    fn near_lower_step_prefers_lower() {
        let p = policy();
        // 1_050_000 距 1_000_000 只有 10%
        assert_eq!(select_step(&p, 1_050_000), 1_000_000);
        // 1_200_000 距 1_000_000 已有 40%
        assert_eq!(select_step(&p, 1_200_000), 1_500_000);
        assert_eq!(select_step(&p, 1_500_000), 1_500_000);
    }

    #[test]
    fn policy_min_wins_tie_break() {
        let mut p = policy();
        p.set_limits(1_000_000, MAX_FREQ).unwrap();
        assert_eq!(select_step(&p, 500_000), 1_000_000);
    }

    #[test]
    fn every_result_is_a_table_entry_within_limits() {
        let mut p = policy();
        p.set_limits(1_000_000, 1_600_000).unwrap();
        for util in (0..=1000).step_by(7) {
            let mut rl = RateLimiter::default();
            let mut q = FrameBoostQueue::new();
            let f = get_next_freq(&p, &mut rl, &mut q, &req(util, 0));
            assert!(p.table().contains(f), "util {util} -> {f}");
            assert!((p.get_min()..=p.get_max()).contains(&f), "util {util} -> {f}");
        }
    }

    #[test]
    fn unchanged_raw_returns_pending() {
        let p = policy();
        let mut rl = RateLimiter::default();
        let mut q = FrameBoostQueue::new();
        let f = get_next_freq(&p, &mut rl, &mut q, &req(400, 0));
        rl.update_next_freq(0, f, Default::default());
        assert_eq!(get_next_freq(&p, &mut rl, &mut q, &req(400, 1)), f);
        assert_eq!(rl.cached_raw_freq(), map_util_freq(400, MAX_FREQ, 1000));
    }

    #[test]
    fn active_boost_overrides_util() {
        let p = policy();
        let mut rl = RateLimiter::default();
        let mut q = FrameBoostQueue::new();
        q.push(FrameBoost::new(1_600_000, 100));
        q.push(FrameBoost::new(1_000_000, 200));

        let mut r = req(10, 50);
        r.frame_aware = true;
        assert_eq!(get_next_freq(&p, &mut rl, &mut q, &r), 1_600_000);

        // 第一个请求过期后只剩 1_000_000
        r.time = 150;
        assert_eq!(get_next_freq(&p, &mut rl, &mut q, &r), 1_000_000);

        // 全部过期后回到按利用率计算，且受 frame_freq 上限约束
        r.time = 250;
        r.util = 800;
        assert_eq!(get_next_freq(&p, &mut rl, &mut q, &r), 1_500_000);
        assert!(q.is_empty());
    }

    #[test]
    fn boost_rounds_up_to_next_step() {
        let p = policy();
        let mut rl = RateLimiter::default();
        let mut q = FrameBoostQueue::new();
        // 1_510_000 距 1_500_000 不足 20%，但加速请求不能被降档
        q.push(FrameBoost::new(1_510_000, 100));
        let mut r = req(0, 50);
        r.frame_aware = true;
        assert_eq!(get_next_freq(&p, &mut rl, &mut q, &r), 1_600_000);
        assert_eq!(select_step(&p, 1_510_000), 1_500_000);
    }

    fn assert_monotonic(p: &CpufreqPolicy, frame_aware: bool) {
        let mut prev = 0;
        for util in (0..=1000).step_by(5) {
            let mut rl = RateLimiter::default();
            let mut q = FrameBoostQueue::new();
            let mut r = req(util, 0);
            r.frame_aware = frame_aware;
            let f = get_next_freq(p, &mut rl, &mut q, &r);
            assert!(f >= prev, "util {util}: {f} < {prev}");
            assert!(p.table().contains(f), "util {util} -> {f}");
            prev = f;
        }
    }

    #[test]
    fn higher_util_never_lowers_freq() {
        // 频率无关基准
        assert_monotonic(&policy(), false);

        // 以当前频率为基准
        let mut p = policy().with_freq_invariant(false);
        p.set_cur(1_500_000);
        assert_monotonic(&p, false);

        // 帧感知开启时基准受 frame_freq 限制
        assert_monotonic(&policy(), true);
    }

    #[test]
    fn boost_ignored_when_frame_aware_off() {
        let p = policy();
        let mut rl = RateLimiter::default();
        let mut q = FrameBoostQueue::new();
        q.push(FrameBoost::new(MAX_FREQ, 100));
        assert_eq!(get_next_freq(&p, &mut rl, &mut q, &req(0, 0)), 300_000);
    }

    #[test]
    fn variant_util_uses_current_freq() {
        let mut p = policy().with_freq_invariant(false);
        p.set_cur(1_000_000);
        let mut rl = RateLimiter::default();
        let mut q = FrameBoostQueue::new();
        // 1_250_000 * 0.8 = 1_000_000
        assert_eq!(get_next_freq(&p, &mut rl, &mut q, &req(800, 0)), 1_000_000);
    }
}
