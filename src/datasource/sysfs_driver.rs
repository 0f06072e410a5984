use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::{
    datasource::file_path::*,
    model::{actuator::CpufreqDriver, frequency_table::Relation, policy::PolicyId},
    utils::file_operate::{read_file, read_u32, write_file},
};

/// 通过 userspace 调速器节点下发频率
pub struct SysfsDriver {
    root: PathBuf,
}

impl SysfsDriver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn node(&self, policy: PolicyId, name: &str) -> PathBuf {
        self.root.join(format!("policy{policy}")).join(name)
    }

    /// 切换到 userspace 调速器，之后 scaling_setspeed 才可写
    pub fn take_over(&self, policy: PolicyId) -> Result<()> {
        let node = self.node(policy, SCALING_GOVERNOR);
        let current = read_file(&node).unwrap_or_default();
        if current.trim() == USERSPACE_GOVERNOR {
            return Ok(());
        }
        write_file(&node, USERSPACE_GOVERNOR)
            .with_context(|| format!("Failed to switch policy{policy} to {USERSPACE_GOVERNOR}"))?;
        info!("policy{policy}: {} -> {USERSPACE_GOVERNOR}", current.trim());
        Ok(())
    }

    fn set_speed(&self, policy: PolicyId, freq: u32) -> Result<()> {
        write_file(self.node(policy, SCALING_SETSPEED), freq.to_string())?;
        Ok(())
    }
}

impl CpufreqDriver for SysfsDriver {
    fn name(&self) -> &str {
        "sysfs"
    }

    fn fast_switch(&self, policy: PolicyId, freq: u32) -> Option<u32> {
        match self.set_speed(policy, freq) {
            Ok(()) => Some(freq),
            Err(e) => {
                debug!("policy{policy} setspeed {freq} failed: {e:#}");
                None
            }
        }
    }

    fn target(&self, policy: PolicyId, freq: u32, relation: Relation) -> Result<u32> {
        self.set_speed(policy, freq)?;
        let cur = read_u32(self.node(policy, SCALING_CUR)).unwrap_or(freq);
        debug!("policy{policy} target {freq}KHz ({relation:?}) -> {cur}KHz");
        Ok(cur)
    }

    fn apply_limits(&self, policy: PolicyId, min: u32, max: u32) -> Result<()> {
        let min_node = self.node(policy, SCALING_MIN);
        let max_node = self.node(policy, SCALING_MAX);

        // 新的 min 高于旧 max 时必须先抬高 max
        let old_max = read_u32(&max_node).unwrap_or(u32::MAX);
        if min > old_max {
            write_file(&max_node, max.to_string())?;
            write_file(&min_node, min.to_string())?;
        } else {
            write_file(&min_node, min.to_string())?;
            write_file(&max_node, max.to_string())?;
        }
        Ok(())
    }
}
