use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use log::{LevelFilter, Metadata, Record};
use once_cell::sync::Lazy;

use crate::datasource::file_path::LOG_LEVEL_PATH;

// 只输出到控制台，由外部服务负责收集
struct CustomLogger;

impl log::Log for CustomLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        // 过滤由 max_level 完成
        true
    }

    fn log(&self, record: &Record) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        println!("[{}][{}]: {}", timestamp, record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: Lazy<CustomLogger> = Lazy::new(|| CustomLogger);

pub fn init_logger() -> Result<()> {
    let log_level = read_log_level_config(LOG_LEVEL_PATH);

    log::set_logger(&*LOGGER)
        .map(|()| log::set_max_level(log_level))
        .with_context(|| "Failed to set logger")?;

    log::info!("Logger initialized with level: {log_level}");
    log::info!("Log level config path: {LOG_LEVEL_PATH}");
    log::debug!("Per-update frequency decisions are only shown at debug level");

    Ok(())
}

/// 解析日志等级文本，无法识别时返回 None
pub fn parse_log_level(text: &str) -> Option<LevelFilter> {
    match text.trim().to_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        "off" => Some(LevelFilter::Off),
        _ => None,
    }
}

/// 读取日志等级配置文件，缺失或非法时使用 Info
pub fn read_log_level_config<P: AsRef<Path>>(path: P) -> LevelFilter {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| parse_log_level(&content))
        .unwrap_or(LevelFilter::Info)
}

pub fn update_log_level() -> Result<()> {
    let new_level = read_log_level_config(LOG_LEVEL_PATH);
    log::set_max_level(new_level);
    log::info!("Log level updated to: {new_level}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_log_level("DEBUG\n"), Some(LevelFilter::Debug));
        assert_eq!(parse_log_level(" warn "), Some(LevelFilter::Warn));
        assert_eq!(parse_log_level("verbose"), None);
    }

    #[test]
    fn missing_or_bad_file_falls_back_to_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log_level");
        assert_eq!(read_log_level_config(&path), LevelFilter::Info);

        std::fs::write(&path, "loud").unwrap();
        assert_eq!(read_log_level_config(&path), LevelFilter::Info);

        std::fs::write(&path, "error").unwrap();
        assert_eq!(read_log_level_config(&path), LevelFilter::Error);
    }
}
