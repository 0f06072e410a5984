use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::Deserialize;

use crate::{
    datasource::{file_path::FRAME_TIME_PIPE, policy_table::ScanOptions},
    model::{
        governor::{FrameAwareGovernor, GovernorOptions},
        policy::PolicyId,
        sampler::{LoadTracking, SamplerFeatures},
        tunables::{TunablesUpdate, up_delay_ns},
    },
    utils::constants::{
        NSEC_PER_MSEC,
        strategy::{
            DEFAULT_SAMPLING_INTERVAL_MS, DEFAULT_WALT_WINDOW_NS, TARGET_FRAME_TIME_US,
            WORKER_RT_PRIORITY,
        },
    },
};

/// [governor] 段
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GovernorSection {
    pub sampling_interval_ms: u64,
    pub load_tracking: LoadTracking,
    pub per_policy_tunables: bool,
    pub fast_switch: bool,
    pub freq_invariant: bool,
    /// 0 表示普通调度
    pub worker_rt_priority: i32,
    pub bind_worker: bool,
    pub rt_max_freq: bool,
    pub uclamp_task: bool,
    pub conservative_pl: bool,
    pub walt_window_ms: u64,
    pub frame_monitor: String,
    pub jank_threshold_us: u32,
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
            load_tracking: LoadTracking::Pelt,
            per_policy_tunables: true,
            fast_switch: true,
            freq_invariant: false,
            worker_rt_priority: WORKER_RT_PRIORITY,
            bind_worker: true,
            rt_max_freq: true,
            uclamp_task: false,
            conservative_pl: false,
            walt_window_ms: DEFAULT_WALT_WINDOW_NS / NSEC_PER_MSEC,
            frame_monitor: FRAME_TIME_PIPE.to_string(),
            jank_threshold_us: TARGET_FRAME_TIME_US,
        }
    }
}

/// [[policy]] 段；省略 id 时作用于所有策略
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub id: Option<PolicyId>,
    pub up_rate_limit_us: Option<u32>,
    pub down_rate_limit_us: Option<u32>,
    pub hispeed_load: Option<u32>,
    pub hispeed_freq: Option<u32>,
    pub rtg_boost_freq: Option<u32>,
    pub pl: Option<bool>,
    pub efficient_freq: Option<Vec<u32>>,
    /// 毫秒
    pub up_delay: Option<Vec<u64>>,
    pub frame_aware: Option<bool>,
    pub frame_freq: Option<u32>,
}

impl PolicySection {
    pub fn to_update(&self) -> Result<TunablesUpdate> {
        if self.efficient_freq.as_ref().is_some_and(Vec::is_empty) {
            bail!("efficient_freq must not be empty");
        }
        if self.up_delay.as_ref().is_some_and(Vec::is_empty) {
            bail!("up_delay must not be empty");
        }

        Ok(TunablesUpdate {
            up_rate_limit_us: self.up_rate_limit_us,
            down_rate_limit_us: self.down_rate_limit_us,
            hispeed_load: self.hispeed_load.map(|v| v.min(100)),
            hispeed_freq: self.hispeed_freq,
            rtg_boost_freq: self.rtg_boost_freq,
            pl: self.pl,
            efficient_freq: self.efficient_freq.clone(),
            up_delay: self.up_delay.as_deref().map(up_delay_ns).transpose()?,
            frame_aware: self.frame_aware,
            frame_freq: self.frame_freq,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub governor: GovernorSection,
    pub policy: Vec<PolicySection>,
}

impl GovernorConfig {
    pub fn options(&self) -> GovernorOptions {
        let g = &self.governor;
        GovernorOptions {
            per_policy_tunables: g.per_policy_tunables,
            load_tracking: g.load_tracking,
            features: SamplerFeatures {
                rt_max_freq: g.rt_max_freq,
                uclamp_task: g.uclamp_task,
                conservative_pl: g.conservative_pl,
            },
            walt_window_ns: g.walt_window_ms.saturating_mul(NSEC_PER_MSEC),
            worker_rt_priority: (g.worker_rt_priority > 0).then_some(g.worker_rt_priority),
            bind_worker: g.bind_worker,
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            fast_switch: self.governor.fast_switch,
            freq_invariant: self.governor.freq_invariant,
        }
    }
}

pub fn config_read<P: AsRef<Path>>(path: P) -> Result<GovernorConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: GovernorConfig = toml::from_str(&text)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if config.governor.sampling_interval_ms == 0 {
        bail!("sampling_interval_ms must be positive");
    }
    if config
        .governor
        .walt_window_ms
        .checked_mul(NSEC_PER_MSEC)
        .is_none()
    {
        bail!("walt_window_ms {} is out of range", config.governor.walt_window_ms);
    }

    info!(
        "Load config succeed: {} policy sections, load_tracking={:?}",
        config.policy.len(),
        config.governor.load_tracking
    );
    Ok(config)
}

/// 把 [[policy]] 段下发给调速器，单个段失败不影响其他段
pub fn apply_policy_sections(governor: &FrameAwareGovernor, config: &GovernorConfig) -> usize {
    let mut applied = 0;
    for section in &config.policy {
        let result = section
            .to_update()
            .and_then(|update| governor.update_tunables(section.id, &update));
        match result {
            Ok(()) => applied += 1,
            Err(e) => match section.id {
                Some(id) => warn!("Invalid tunables for policy{id}: {e:#}"),
                None => warn!("Invalid tunables for all policies: {e:#}"),
            },
        }
    }
    applied
}
