use anyhow::{Result, bail};

use crate::{
    model::{
        frequency_table::FrequencyTable,
        sampler::WaltLoad,
        tunables::ClusterKind,
    },
    utils::constants::SCHED_CAPACITY_SCALE,
};

pub type PolicyId = u32;

/// 一个时钟域 (共享电压/频率的一组 CPU)
#[derive(Debug, Clone)]
pub struct CpufreqPolicy {
    id: PolicyId,
    cpus: Vec<usize>,
    table: FrequencyTable,
    cur: u32,
    min: u32,
    max: u32,
    cpuinfo_min: u32,
    cpuinfo_max: u32,
    fast_switch_enabled: bool,
    freq_invariant: bool,
    cluster: ClusterKind,
}

impl CpufreqPolicy {
    pub fn new(id: PolicyId, cpus: Vec<usize>, table: FrequencyTable) -> Result<Self> {
        if cpus.is_empty() {
            bail!("Policy {id} has no CPUs");
        }
        if table.is_empty() {
            bail!("Policy {id} has an empty frequency table");
        }

        let (lo, hi) = (table.min_freq(), table.max_freq());
        Ok(Self {
            id,
            cpus,
            table,
            cur: lo,
            min: lo,
            max: hi,
            cpuinfo_min: lo,
            cpuinfo_max: hi,
            fast_switch_enabled: false,
            freq_invariant: true,
            cluster: ClusterKind::Little,
        })
    }

    pub fn with_fast_switch(mut self, enabled: bool) -> Self {
        self.fast_switch_enabled = enabled;
        self
    }

    /// 利用率是否已经与频率无关 (arch_scale_freq_invariant)
    pub fn with_freq_invariant(mut self, invariant: bool) -> Self {
        self.freq_invariant = invariant;
        self
    }

    /// 集群类型决定首次初始化时的默认参数
    pub fn with_cluster(mut self, cluster: ClusterKind) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn cluster(&self) -> ClusterKind {
        self.cluster
    }

    pub fn id(&self) -> PolicyId {
        self.id
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    pub fn first_cpu(&self) -> usize {
        self.cpus[0]
    }

    pub fn is_shared(&self) -> bool {
        self.cpus.len() > 1
    }

    pub fn table(&self) -> &FrequencyTable {
        &self.table
    }

    crate::simple_getter!(
        cur: u32,
        min: u32,
        max: u32,
        cpuinfo_min: u32,
        cpuinfo_max: u32,
    );

    crate::getter_setter!(fast_switch_enabled: bool, "policy{} fast switch: {}");

    pub fn is_freq_invariant(&self) -> bool {
        self.freq_invariant
    }

    /// 设置当前频率，始终保持在 [min, max] 内
    pub fn set_cur(&mut self, freq: u32) {
        self.cur = freq.clamp(self.min, self.max);
    }

    /// 更新策略限制，非法范围被拒绝
    pub fn set_limits(&mut self, min: u32, max: u32) -> Result<()> {
        let min = min.max(self.cpuinfo_min);
        let max = max.min(self.cpuinfo_max);
        if min > max {
            bail!("Invalid limits for policy{}: min {min} > max {max}", self.id);
        }
        self.min = min;
        self.max = max;
        self.cur = self.cur.clamp(min, max);
        Ok(())
    }

    /// 按当前限制解析到硬件频率
    pub fn resolve(&self, freq: u32) -> u32 {
        self.table.resolve(freq, self.min, self.max)
    }
}

/// 每个 CPU 的采样状态
#[derive(Debug, Clone, Default)]
pub struct CpuState {
    pub cpu: usize,
    pub last_update: u64,
    pub util: u64,
    pub max: u64,
    pub bw_dl: u64,
    pub walt: WaltLoad,
    /// 仅单 CPU 策略使用
    pub saved_idle_calls: Option<u64>,
}

impl CpuState {
    pub fn new(cpu: usize) -> Self {
        Self {
            cpu,
            max: SCHED_CAPACITY_SCALE,
            ..Default::default()
        }
    }

    /// 自上次检查以来 CPU 没有进入过空闲
    pub fn is_busy(&mut self, idle_calls: Option<u64>) -> bool {
        let Some(calls) = idle_calls else {
            return false;
        };
        let busy = self.saved_idle_calls == Some(calls);
        self.saved_idle_calls = Some(calls);
        busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CpufreqPolicy {
        CpufreqPolicy::new(0, vec![0, 1, 2, 3], FrequencyTable::new(vec![300_000, 1_000_000, 1_800_000]))
            .unwrap()
    }

    #[test]
    fn new_policy_spans_table() {
        let p = policy();
        assert_eq!(p.get_min(), 300_000);
        assert_eq!(p.get_max(), 1_800_000);
        assert_eq!(p.get_cur(), 300_000);
        assert!(p.is_shared());
        assert_eq!(p.first_cpu(), 0);
    }

    #[test]
    fn empty_inputs_are_rejected() {
        assert!(CpufreqPolicy::new(1, vec![], FrequencyTable::new(vec![1])).is_err());
        assert!(CpufreqPolicy::new(1, vec![0], FrequencyTable::default()).is_err());
    }

    #[test]
    fn limits_clamp_current_freq() {
        let mut p = policy();
        p.set_cur(1_800_000);
        p.set_limits(300_000, 1_000_000).unwrap();
        assert_eq!(p.get_cur(), 1_000_000);
        assert!(p.set_limits(1_800_000, 1_000_000).is_err());
        p.set_cur(5_000_000);
        assert_eq!(p.get_cur(), 1_000_000);
    }

    #[test]
    fn busy_when_idle_counter_unchanged() {
        let mut s = CpuState::new(0);
        assert!(!s.is_busy(Some(10)));
        assert!(s.is_busy(Some(10)));
        assert!(!s.is_busy(Some(11)));
        assert!(!s.is_busy(None));
        assert_eq!(s.max, SCHED_CAPACITY_SCALE);
    }
}
