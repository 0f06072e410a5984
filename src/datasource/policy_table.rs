use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    datasource::file_path::*,
    model::{
        frequency_table::FrequencyTable,
        policy::{CpufreqPolicy, PolicyId},
        tunables::{ClusterKind, parse_list},
    },
    utils::file_operate::{read_file, read_u32},
};

static POLICY_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^policy(\d+)$").unwrap());
static CPU_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)(?:-(\d+))?").unwrap());

/// 策略发现选项
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub fast_switch: bool,
    pub freq_invariant: bool,
}

/// 解析 "0-3 5" 或 "0,1,2" 形式的 CPU 列表
pub fn parse_cpu_list(text: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for caps in CPU_RANGE.captures_iter(text) {
        let start: usize = caps[1].parse()?;
        let end: usize = match caps.get(2) {
            Some(m) => m.as_str().parse()?,
            None => start,
        };
        if end < start {
            bail!("Invalid CPU range {start}-{end}");
        }
        cpus.extend(start..=end);
    }

    cpus.sort_unstable();
    cpus.dedup();
    if cpus.is_empty() {
        return Err(anyhow!("Empty CPU list: {:?}", text.trim()));
    }
    Ok(cpus)
}

fn policy_id(path: &Path) -> Option<PolicyId> {
    let name = path.file_name()?.to_str()?;
    POLICY_DIR.captures(name)?[1].parse().ok()
}

fn read_policy(dir: &Path, id: PolicyId, cluster: ClusterKind, opts: ScanOptions) -> Result<CpufreqPolicy> {
    let freqs = parse_list::<u32>(&read_file(dir.join(AVAILABLE_FREQS))?)
        .with_context(|| format!("Invalid frequency table in {}", dir.display()))?;

    let cpus_text = read_file(dir.join(RELATED_CPUS))
        .or_else(|_| read_file(dir.join(AFFECTED_CPUS)))?;
    let cpus = parse_cpu_list(&cpus_text)?;

    let mut policy = CpufreqPolicy::new(id, cpus, FrequencyTable::new(freqs))?
        .with_cluster(cluster)
        .with_fast_switch(opts.fast_switch)
        .with_freq_invariant(opts.freq_invariant);

    let min = read_u32(dir.join(SCALING_MIN)).unwrap_or(policy.get_cpuinfo_min());
    let max = read_u32(dir.join(SCALING_MAX)).unwrap_or(policy.get_cpuinfo_max());
    policy.set_limits(min, max)?;
    if let Ok(cur) = read_u32(dir.join(SCALING_CUR)) {
        policy.set_cur(cur);
    }

    Ok(policy)
}

/// 扫描 cpufreq 目录下所有 policyN
pub fn scan_policies<P: AsRef<Path>>(root: P, opts: ScanOptions) -> Result<Vec<CpufreqPolicy>> {
    let root = root.as_ref();
    let mut dirs: Vec<(PolicyId, PathBuf)> = fs::read_dir(root)
        .with_context(|| format!("Failed to read {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter_map(|path| policy_id(&path).map(|id| (id, path)))
        .collect();
    dirs.sort_by_key(|(id, _)| *id);

    let total = dirs.len();
    let mut policies = Vec::with_capacity(total);
    for (index, (id, dir)) in dirs.iter().enumerate() {
        let cluster = ClusterKind::from_policy_index(index, total);
        match read_policy(dir, *id, cluster, opts) {
            Ok(policy) => {
                info!(
                    "policy{id}: cpus={:?} cluster={cluster:?} freqs={} range={}-{}KHz",
                    policy.cpus(),
                    policy.table().len(),
                    policy.get_min(),
                    policy.get_max()
                );
                debug!("policy{id} table: {:?}", policy.table().freqs());
                policies.push(policy);
            }
            Err(e) => warn!("Skipping policy{id}: {e:#}"),
        }
    }

    if policies.is_empty() {
        bail!("No usable cpufreq policy under {}", root.display());
    }
    Ok(policies)
}
