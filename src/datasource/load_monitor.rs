use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Result, bail};
use log::debug;

use crate::{
    model::sampler::{CpuSample, UtilBreakdown},
    utils::{constants::SCHED_CAPACITY_SCALE, file_operate::read_file},
};

/// /proc/stat 中单个 CPU 的累计时间 (jiffies)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    fn busy(&self) -> u64 {
        self.user + self.nice + self.system
    }

    fn interrupt(&self) -> u64 {
        self.irq + self.softirq + self.steal
    }

    fn total(&self) -> u64 {
        self.busy() + self.interrupt() + self.idle + self.iowait
    }

    fn delta(&self, prev: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(prev.user),
            nice: self.nice.saturating_sub(prev.nice),
            system: self.system.saturating_sub(prev.system),
            idle: self.idle.saturating_sub(prev.idle),
            iowait: self.iowait.saturating_sub(prev.iowait),
            irq: self.irq.saturating_sub(prev.irq),
            softirq: self.softirq.saturating_sub(prev.softirq),
            steal: self.steal.saturating_sub(prev.steal),
        }
    }
}

/// 解析 /proc/stat 中的 cpuN 行，忽略汇总行
pub fn parse_proc_stat(text: &str) -> HashMap<usize, CpuTimes> {
    let mut cpus = HashMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(cpu) = fields
            .next()
            .and_then(|name| name.strip_prefix("cpu"))
            .and_then(|id| id.parse::<usize>().ok())
        else {
            continue;
        };

        let values: Vec<u64> = fields.map_while(|f| f.parse().ok()).collect();
        if values.len() < 4 {
            continue;
        }
        let get = |i: usize| values.get(i).copied().unwrap_or(0);
        cpus.insert(
            cpu,
            CpuTimes {
                user: get(0),
                nice: get(1),
                system: get(2),
                idle: get(3),
                iowait: get(4),
                irq: get(5),
                softirq: get(6),
                steal: get(7),
            },
        );
    }
    cpus
}

/// 按两次读取之间的差值生成调度采样
pub struct LoadMonitor {
    path: PathBuf,
    prev: HashMap<usize, CpuTimes>,
    idle_calls: HashMap<usize, u64>,
}

impl LoadMonitor {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            prev: HashMap::new(),
            idle_calls: HashMap::new(),
        }
    }

    /// 读取一次 /proc/stat；首次读取只建立基线，返回空结果
    pub fn sample(&mut self) -> Result<HashMap<usize, CpuSample>> {
        let current = parse_proc_stat(&read_file(&self.path)?);
        if current.is_empty() {
            bail!("No per-CPU lines in {}", self.path.display());
        }

        let mut samples = HashMap::new();
        for (&cpu, times) in &current {
            let Some(prev) = self.prev.get(&cpu) else {
                continue;
            };
            let delta = times.delta(prev);
            let total = delta.total();
            if total == 0 {
                continue;
            }

            // 窗口内出现过空闲即视为进入过 idle
            let calls = self.idle_calls.entry(cpu).or_insert(0);
            if delta.idle + delta.iowait > 0 {
                *calls += 1;
            }

            let sample = CpuSample {
                util: UtilBreakdown {
                    cfs: delta.busy() * SCHED_CAPACITY_SCALE / total,
                    irq: delta.interrupt() * SCHED_CAPACITY_SCALE / total,
                    ..Default::default()
                },
                max_capacity: SCHED_CAPACITY_SCALE,
                idle_calls: Some(*calls),
                ..Default::default()
            };
            debug!("cpu{cpu}: cfs={} irq={}", sample.util.cfs, sample.util.irq);
            samples.insert(cpu, sample);
        }

        self.prev = current;
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const STAT_A: &str = "cpu  100 0 100 800 0 0 0 0 0 0\n\
                          cpu0 50 0 50 400 0 0 0 0 0 0\n\
                          cpu1 50 0 50 400 0 0 0 0 0 0\n\
                          intr 12345\n";

    const STAT_B: &str = "cpu  300 0 200 1300 0 0 0 0 0 0\n\
                          cpu0 200 0 100 400 0 0 0 0 0 0\n\
                          cpu1 100 0 100 750 0 50 0 0 0 0\n";

    #[test]
    fn parses_per_cpu_lines() {
        let cpus = parse_proc_stat(STAT_A);
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[&0].user, 50);
        assert_eq!(cpus[&1].idle, 400);
    }

    #[test]
    fn deltas_become_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        fs::write(&path, STAT_A).unwrap();

        let mut monitor = LoadMonitor::new(&path);
        assert!(monitor.sample().unwrap().is_empty());

        fs::write(&path, STAT_B).unwrap();
        let samples = monitor.sample().unwrap();

        // cpu0 全程忙碌
        let s0 = samples[&0];
        assert_eq!(s0.util.cfs, SCHED_CAPACITY_SCALE);
        assert_eq!(s0.idle_calls, Some(0));

        // cpu1: 100 busy, 50 irq, 350 idle
        let s1 = samples[&1];
        assert_eq!(s1.util.cfs, 100 * 1024 / 500);
        assert_eq!(s1.util.irq, 50 * 1024 / 500);
        assert_eq!(s1.idle_calls, Some(1));
    }

    #[test]
    fn empty_stat_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        fs::write(&path, "intr 1\n").unwrap();
        assert!(LoadMonitor::new(&path).sample().is_err());
    }
}
