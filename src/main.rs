mod datasource;
mod model;
mod utils;

use std::{env, sync::Arc, thread, time::Duration};

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::{
    datasource::{
        config_parser::{GovernorConfig, apply_policy_sections, config_read},
        file_path::*,
        frame_monitor::{FrameBoostReceiver, FrameMonitor, monitor_frames},
        load_monitor::LoadMonitor,
        node_monitor::monitor_config,
        policy_table::scan_policies,
        sysfs_driver::SysfsDriver,
    },
    model::{
        governor::{CpufreqGovernor, FrameAwareGovernor},
        rate_limiter::UpdateFlags,
        tunables::TUNABLE_ATTRS,
    },
    utils::{
        clock::monotonic_ns,
        constants::{AUTHOR, NOTES, SPECIAL, VERSION},
        file_operate::check_read_simple,
        log_monitor::monitor_log_level,
        logger::init_logger,
    },
};

fn spawn_named<F>(name: &str, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new().name(thread_name.clone()).spawn(move || {
        if let Err(e) = f() {
            error!("{thread_name} error: {e:#}");
        }
    })?;
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "-h" => {
                println!("{NOTES}");
                println!("{AUTHOR}");
                println!("{SPECIAL}");
                println!("Usage:");
                println!("\t-v show version");
                println!("\t-h show help");
                return Ok(());
            }
            "-v" => {
                println!("{NOTES}");
                println!("{AUTHOR}");
                println!("{SPECIAL}");
                println!("{VERSION}");
                return Ok(());
            }
            other => {
                println!("Unknown argument: {other}");
                println!("Use -h for help");
                return Ok(());
            }
        }
    }

    init_logger()?;

    info!("{NOTES}");
    info!("{AUTHOR}");
    info!("{SPECIAL}");
    info!("{VERSION}");

    let config = if check_read_simple(CONFIG_FILE) {
        info!("Reading config file: {CONFIG_FILE}");
        config_read(CONFIG_FILE)?
    } else {
        warn!("Config file not found: {CONFIG_FILE}, using defaults");
        GovernorConfig::default()
    };

    let policies = scan_policies(CPUFREQ_ROOT, config.scan_options())?;
    let driver = Arc::new(SysfsDriver::new(CPUFREQ_ROOT));
    let governor = Arc::new(FrameAwareGovernor::new(driver.clone(), config.options()));

    let mut first_cpus = Vec::with_capacity(policies.len());
    for policy in policies {
        let id = policy.id();
        driver.take_over(id)?;
        first_cpus.push(policy.first_cpu());
        governor.init(policy)?;
        governor.start(id)?;
    }
    let applied = apply_policy_sections(&governor, &config);
    info!(
        "{} governor running on {} policies, {applied} config sections applied",
        governor.name(),
        first_cpus.len()
    );
    for id in governor.policy_ids() {
        let values: Vec<String> = TUNABLE_ATTRS
            .iter()
            .filter_map(|attr| {
                governor
                    .show_tunable(id, attr)
                    .ok()
                    .map(|v| format!("{attr}={}", v.trim()))
            })
            .collect();
        info!("policy{id}: {}", values.join(" "));
    }

    // 每个策略注册一个卡顿帧接收者
    let frames = Arc::new(FrameMonitor::new());
    for &cpu in &first_cpus {
        frames.register(Arc::new(FrameBoostReceiver::new(
            Arc::clone(&governor),
            cpu,
            config.governor.jank_threshold_us,
        )));
    }
    info!("{} frame receivers registered", frames.receiver_count());

    let frame_path = config.governor.frame_monitor.clone();
    let frame_source = Arc::clone(&frames);
    spawn_named(FRAME_THREAD, move || monitor_frames(frame_path, frame_source))?;

    if check_read_simple(CONFIG_FILE) {
        let config_governor = Arc::clone(&governor);
        spawn_named(CONF_THREAD, move || {
            monitor_config(CONFIG_FILE.to_string(), config_governor)
        })?;
    }

    spawn_named(LOG_LEVEL_THREAD, monitor_log_level)?;

    info!("{MAIN_THREAD} Start");
    let interval = Duration::from_millis(config.governor.sampling_interval_ms);
    let mut load = LoadMonitor::new(PROC_STAT);

    loop {
        thread::sleep(interval);
        let now = monotonic_ns();
        match load.sample() {
            Ok(samples) => {
                for (cpu, sample) in &samples {
                    governor.update_util(*cpu, now, sample, UpdateFlags::empty());
                }
                debug!("{} CPUs sampled", samples.len());
            }
            Err(e) => warn!("Failed to sample CPU load: {e:#}"),
        }
    }
}
