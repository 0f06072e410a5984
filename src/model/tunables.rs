use anyhow::{Context, Result, anyhow, bail};
use log::debug;

use crate::utils::constants::{NSEC_PER_MSEC, defaults};

/// 集群类型，决定默认可调参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterKind {
    /// 小核 (cpu0 所在集群)
    Little,
    /// 大核 (cpu4 所在集群)
    Big,
    /// 超大核 (cpu7 所在集群)
    Prime,
}

impl ClusterKind {
    /// 按策略在系统中的顺序推断集群类型
    pub fn from_policy_index(index: usize, total: usize) -> Self {
        match (index, total) {
            (0, _) => ClusterKind::Little,
            (i, t) if t >= 3 && i == t - 1 => ClusterKind::Prime,
            _ => ClusterKind::Big,
        }
    }
}

/// 调速器可调参数
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub up_rate_limit_us: u32,
    pub down_rate_limit_us: u32,
    pub hispeed_load: u32,
    pub hispeed_freq: u32,
    pub rtg_boost_freq: u32,
    pub pl: bool,
    /// 能效频点列表 (KHz)
    pub efficient_freq: Vec<u32>,
    /// 升频延迟列表 (ns)
    pub up_delay: Vec<u64>,
    pub frame_aware: bool,
    pub frame_freq: u32,
}

/// 经过校验的参数更新，只包含需要修改的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunablesUpdate {
    pub up_rate_limit_us: Option<u32>,
    pub down_rate_limit_us: Option<u32>,
    pub hispeed_load: Option<u32>,
    pub hispeed_freq: Option<u32>,
    pub rtg_boost_freq: Option<u32>,
    pub pl: Option<bool>,
    pub efficient_freq: Option<Vec<u32>>,
    pub up_delay: Option<Vec<u64>>,
    pub frame_aware: Option<bool>,
    pub frame_freq: Option<u32>,
}

impl TunablesUpdate {
    pub fn is_empty(&self) -> bool {
        *self == TunablesUpdate::default()
    }

    /// 是否修改了升降频速率限制
    pub fn touches_rate_limits(&self) -> bool {
        self.up_rate_limit_us.is_some() || self.down_rate_limit_us.is_some()
    }

    /// 是否修改了需要重新换算为利用率的频率
    pub fn touches_target_utils(&self) -> bool {
        self.hispeed_freq.is_some() || self.rtg_boost_freq.is_some()
    }
}

impl Tunables {
    pub fn defaults_for(kind: ClusterKind) -> Self {
        let (up_rate, frame_freq) = match kind {
            ClusterKind::Little => (defaults::UP_RATE_LIMIT_US_LP, defaults::FRAME_FREQ_LP),
            ClusterKind::Big => (defaults::UP_RATE_LIMIT_US_HP, defaults::FRAME_FREQ_HP),
            ClusterKind::Prime => (defaults::UP_RATE_LIMIT_US_PR, defaults::FRAME_FREQ_PR),
        };

        let (efficient, up_delay_ms, rtg, hs_load, hs_freq) = match kind {
            ClusterKind::Little => (
                defaults::EFFICIENT_FREQ_LP,
                defaults::UP_DELAY_MS_LP,
                defaults::RTG_BOOST_FREQ_LP,
                defaults::HISPEED_LOAD_LP,
                defaults::HISPEED_FREQ_LP,
            ),
            ClusterKind::Big => (
                defaults::EFFICIENT_FREQ_HP,
                defaults::UP_DELAY_MS_HP,
                defaults::RTG_BOOST_FREQ_HP,
                defaults::HISPEED_LOAD_HP,
                defaults::HISPEED_FREQ_HP,
            ),
            ClusterKind::Prime => (
                defaults::EFFICIENT_FREQ_PR,
                defaults::UP_DELAY_MS_PR,
                defaults::RTG_BOOST_FREQ_PR,
                defaults::HISPEED_LOAD_PR,
                defaults::HISPEED_FREQ_PR,
            ),
        };

        Self {
            up_rate_limit_us: up_rate,
            down_rate_limit_us: defaults::DOWN_RATE_LIMIT_US,
            hispeed_load: hs_load,
            hispeed_freq: hs_freq,
            rtg_boost_freq: rtg,
            pl: defaults::PL,
            efficient_freq: efficient.to_vec(),
            up_delay: up_delay_ms.iter().map(|ms| ms * NSEC_PER_MSEC).collect(),
            frame_aware: false,
            frame_freq,
        }
    }

    pub fn up_rate_delay_ns(&self) -> u64 {
        u64::from(self.up_rate_limit_us) * 1000
    }

    pub fn down_rate_delay_ns(&self) -> u64 {
        u64::from(self.down_rate_limit_us) * 1000
    }

    /// 应用已校验的更新
    pub fn apply(&mut self, update: &TunablesUpdate) {
        if let Some(v) = update.up_rate_limit_us {
            self.up_rate_limit_us = v;
        }
        if let Some(v) = update.down_rate_limit_us {
            self.down_rate_limit_us = v;
        }
        if let Some(v) = update.hispeed_load {
            self.hispeed_load = v.min(100);
        }
        if let Some(v) = update.hispeed_freq {
            self.hispeed_freq = v;
        }
        if let Some(v) = update.rtg_boost_freq {
            self.rtg_boost_freq = v;
        }
        if let Some(v) = update.pl {
            self.pl = v;
        }
        if let Some(v) = &update.efficient_freq {
            self.efficient_freq = v.clone();
        }
        if let Some(v) = &update.up_delay {
            self.up_delay = v.clone();
        }
        if let Some(v) = update.frame_aware {
            self.frame_aware = v;
        }
        if let Some(v) = update.frame_freq {
            self.frame_freq = v;
        }
    }

    /// 按属性名写入文本值，解析失败时保留原值
    pub fn store(&mut self, attr: &str, text: &str) -> Result<TunablesUpdate> {
        let update = parse_attr(attr, text)?;
        self.apply(&update);
        debug!("tunable {attr} <- {}", text.trim());
        Ok(update)
    }

    /// 按属性名读取文本值
    pub fn show(&self, attr: &str) -> Result<String> {
        let text = match attr {
            "up_rate_limit_us" => self.up_rate_limit_us.to_string(),
            "down_rate_limit_us" => self.down_rate_limit_us.to_string(),
            "hispeed_load" => self.hispeed_load.to_string(),
            "hispeed_freq" => self.hispeed_freq.to_string(),
            "rtg_boost_freq" => self.rtg_boost_freq.to_string(),
            "pl" => u8::from(self.pl).to_string(),
            "frame_aware" => u8::from(self.frame_aware).to_string(),
            "frame_freq" => self.frame_freq.to_string(),
            "efficient_freq" => join(self.efficient_freq.iter()),
            "up_delay" => join(self.up_delay.iter().map(|ns| ns / NSEC_PER_MSEC)),
            _ => return Err(anyhow!("Unknown tunable: {attr}")),
        };
        Ok(text)
    }
}

/// 所有可写属性名
pub const TUNABLE_ATTRS: &[&str] = &[
    "up_rate_limit_us",
    "down_rate_limit_us",
    "hispeed_load",
    "hispeed_freq",
    "rtg_boost_freq",
    "frame_freq",
    "frame_aware",
    "pl",
    "efficient_freq",
    "up_delay",
];

/// 把单个属性的文本解析成更新项
pub fn parse_attr(attr: &str, text: &str) -> Result<TunablesUpdate> {
    let mut update = TunablesUpdate::default();
    match attr {
        "up_rate_limit_us" => update.up_rate_limit_us = Some(parse_uint(attr, text)?),
        "down_rate_limit_us" => update.down_rate_limit_us = Some(parse_uint(attr, text)?),
        "hispeed_load" => update.hispeed_load = Some(parse_uint(attr, text)?.min(100)),
        "hispeed_freq" => update.hispeed_freq = Some(parse_uint(attr, text)?),
        "rtg_boost_freq" => update.rtg_boost_freq = Some(parse_uint(attr, text)?),
        "frame_freq" => update.frame_freq = Some(parse_uint(attr, text)?),
        "frame_aware" => update.frame_aware = Some(parse_bool(attr, text)?),
        "pl" => update.pl = Some(parse_bool(attr, text)?),
        "efficient_freq" => update.efficient_freq = Some(parse_list::<u32>(text)?),
        "up_delay" => {
            update.up_delay = Some(up_delay_ns(&parse_list::<u64>(text)?)?);
        }
        _ => bail!("Unknown tunable: {attr}"),
    }
    Ok(update)
}

/// 升频延迟由 ms 换算为 ns，溢出时整体拒绝
pub fn up_delay_ns(ms: &[u64]) -> Result<Vec<u64>> {
    ms.iter()
        .map(|&v| {
            v.checked_mul(NSEC_PER_MSEC)
                .ok_or_else(|| anyhow!("up_delay {v}ms is out of range"))
        })
        .collect()
}

fn parse_uint(attr: &str, text: &str) -> Result<u32> {
    text.trim()
        .parse::<u32>()
        .with_context(|| format!("Invalid value for {attr}: {:?}", text.trim()))
}

/// 与 kstrtobool 一致：接受 1/0、y/n、on/off
fn parse_bool(attr: &str, text: &str) -> Result<bool> {
    match text.trim().to_lowercase().as_str() {
        "1" | "y" | "yes" | "on" | "true" => Ok(true),
        "0" | "n" | "no" | "off" | "false" => Ok(false),
        other => Err(anyhow!("Invalid boolean for {attr}: {other:?}")),
    }
}

/// 解析空格分隔的数字列表，任一项非法则整体拒绝
pub fn parse_list<T>(text: &str) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let values = text
        .split_whitespace()
        .map(|item| {
            item.parse::<T>()
                .with_context(|| format!("Invalid list item: {item:?}"))
        })
        .collect::<Result<Vec<T>>>()?;

    if values.is_empty() {
        bail!("Empty list");
    }
    Ok(values)
}

fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
    items.map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_defaults_differ() {
        let lp = Tunables::defaults_for(ClusterKind::Little);
        let pr = Tunables::defaults_for(ClusterKind::Prime);
        assert_eq!(lp.up_rate_limit_us, 1300);
        assert_eq!(lp.frame_freq, 1_708_800);
        assert_eq!(lp.up_delay, vec![2560 * NSEC_PER_MSEC]);
        assert_eq!(pr.up_rate_limit_us, 2170);
        assert_eq!(pr.hispeed_load, 65);
        assert!(!pr.frame_aware);
    }

    #[test]
    fn cluster_kind_from_index() {
        assert_eq!(ClusterKind::from_policy_index(0, 3), ClusterKind::Little);
        assert_eq!(ClusterKind::from_policy_index(1, 3), ClusterKind::Big);
        assert_eq!(ClusterKind::from_policy_index(2, 3), ClusterKind::Prime);
        assert_eq!(ClusterKind::from_policy_index(1, 2), ClusterKind::Big);
    }

    #[test]
    fn store_and_show_lists() {
        let mut t = Tunables::defaults_for(ClusterKind::Big);
        t.store("efficient_freq", "1100000 1500000 1900800\n").unwrap();
        t.store("up_delay", "10 20").unwrap();
        assert_eq!(t.efficient_freq, vec![1_100_000, 1_500_000, 1_900_800]);
        assert_eq!(t.up_delay, vec![10 * NSEC_PER_MSEC, 20 * NSEC_PER_MSEC]);
        assert_eq!(t.show("efficient_freq").unwrap(), "1100000 1500000 1900800");
        assert_eq!(t.show("up_delay").unwrap(), "10 20");
    }

    #[test]
    fn malformed_list_keeps_previous_value() {
        let mut t = Tunables::defaults_for(ClusterKind::Little);
        let before = t.clone();
        assert!(t.store("efficient_freq", "1000 abc").is_err());
        assert!(t.store("up_delay", "   ").is_err());
        assert!(t.store("up_rate_limit_us", "-5").is_err());
        assert!(t.store("no_such_attr", "1").is_err());
        assert_eq!(t, before);
    }

    #[test]
    fn oversized_up_delay_is_rejected() {
        let mut t = Tunables::defaults_for(ClusterKind::Big);
        let before = t.clone();
        assert!(t.store("up_delay", "18446744073709551615").is_err());
        assert!(t.store("up_delay", "10 18446744073709551").is_err());
        assert_eq!(t, before);

        assert_eq!(up_delay_ns(&[3]).unwrap(), vec![3 * NSEC_PER_MSEC]);
    }

    #[test]
    fn hispeed_load_is_capped() {
        let mut t = Tunables::defaults_for(ClusterKind::Little);
        t.store("hispeed_load", "250").unwrap();
        assert_eq!(t.hispeed_load, 100);
    }

    #[test]
    fn booleans_accept_kernel_spellings() {
        let mut t = Tunables::defaults_for(ClusterKind::Little);
        t.store("frame_aware", "Y").unwrap();
        assert!(t.frame_aware);
        t.store("pl", "off").unwrap();
        assert!(!t.pl);
        assert_eq!(t.show("frame_aware").unwrap(), "1");
    }

    #[test]
    fn update_flags_reflect_touched_fields() {
        let update = parse_attr("down_rate_limit_us", "500").unwrap();
        assert!(update.touches_rate_limits());
        assert!(!update.touches_target_utils());
        assert!(TunablesUpdate::default().is_empty());
    }
}
