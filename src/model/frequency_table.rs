use log::debug;

/// 频率查找关系，对应 cpufreq 的 RELATION_L / RELATION_H
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// 大于等于目标的最低频率
    Low,
    /// 小于等于目标的最高频率
    High,
}

/// 硬件频率表 - 升序保存，单位 KHz
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrequencyTable {
    freqs: Vec<u32>,
}

impl FrequencyTable {
    pub fn new(mut freqs: Vec<u32>) -> Self {
        freqs.retain(|&f| f > 0);
        freqs.sort_unstable();
        freqs.dedup();
        Self { freqs }
    }

    pub fn is_empty(&self) -> bool {
        self.freqs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.freqs.len()
    }

    pub fn freqs(&self) -> &[u32] {
        &self.freqs
    }

    pub fn contains(&self, freq: u32) -> bool {
        self.freqs.binary_search(&freq).is_ok()
    }

    /// 获取最低频率
    pub fn min_freq(&self) -> u32 {
        self.freqs.first().copied().unwrap_or(0)
    }

    /// 获取最高频率
    pub fn max_freq(&self) -> u32 {
        self.freqs.last().copied().unwrap_or(0)
    }

    /// 在 [min, max] 范围内按关系查找表项
    ///
    /// 范围内没有表项时返回 None，调用方自行决定回退策略。
    pub fn target(&self, freq: u32, min: u32, max: u32, relation: Relation) -> Option<u32> {
        let freq = freq.clamp(min, max.max(min));
        let in_range = || self.freqs.iter().copied().filter(|&f| f >= min && f <= max);

        let found = match relation {
            Relation::Low => in_range()
                .find(|&f| f >= freq)
                .or_else(|| in_range().last()),
            Relation::High => in_range()
                .filter(|&f| f <= freq)
                .last()
                .or_else(|| in_range().next()),
        };

        debug!("table target freq={freq} relation={relation:?} -> {found:?}");
        found
    }

    /// 与 cpufreq_driver_resolve_freq 相同：限制到 [min, max] 后取 RELATION_L
    ///
    /// 表为空时退回到被限制后的原始值。
    pub fn resolve(&self, freq: u32, min: u32, max: u32) -> u32 {
        self.target(freq, min, max, Relation::Low)
            .unwrap_or_else(|| freq.clamp(min, max.max(min)))
    }
}

impl From<Vec<u32>> for FrequencyTable {
    fn from(freqs: Vec<u32>) -> Self {
        Self::new(freqs)
    }
}
