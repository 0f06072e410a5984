use std::sync::Arc;

use anyhow::Result;
use inotify::WatchMask;
use log::{error, info, warn};

use crate::{
    datasource::{
        config_parser::{apply_policy_sections, config_read},
        file_path::CONF_THREAD,
    },
    model::governor::FrameAwareGovernor,
    utils::{file_operate::check_read_simple, inotify::InotifyWatcher},
};

/// 重新读取配置并下发可调参数
pub fn reload_config(config_file: &str, governor: &FrameAwareGovernor) -> Result<usize> {
    let config = config_read(config_file)?;
    if config.options().load_tracking != governor.options().load_tracking {
        warn!("load_tracking change requires a restart, ignored");
    }
    Ok(apply_policy_sections(governor, &config))
}

pub fn monitor_config(config_file: String, governor: Arc<FrameAwareGovernor>) -> Result<()> {
    info!("{CONF_THREAD} Start");

    if !check_read_simple(&config_file) {
        error!("CONFIG NOT FOUND: {config_file}");
        return Err(anyhow::anyhow!("Config file not found: {config_file}"));
    };

    info!("Using Config: {config_file}");

    let mut inotify = InotifyWatcher::new()?;
    inotify.add(&config_file, WatchMask::CLOSE_WRITE | WatchMask::MODIFY)?;

    loop {
        inotify.wait_and_handle()?;
        match reload_config(&config_file, &governor) {
            Ok(n) => info!("Config reloaded, {n} policy sections applied"),
            // 保留旧参数继续运行
            Err(e) => warn!("Failed to reload config: {e:#}"),
        }
    }
}
