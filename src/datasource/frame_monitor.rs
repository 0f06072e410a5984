use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    sync::{Arc, RwLock},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::{
    datasource::file_path::FRAME_THREAD,
    model::governor::FrameAwareGovernor,
    utils::clock::monotonic_ns,
};

const REOPEN_DELAY_MS: u64 = 500;

/// 卡顿帧接收者
pub trait JankReceiver: Send + Sync {
    /// 帧耗时达到该值 (us) 才会回调
    fn jank_threshold_us(&self) -> u32;

    fn on_jank_frame(&self, frame_time_us: u32, now: u64);
}

/// 把卡顿帧转发给调速器中指定 CPU 所属的策略
pub struct FrameBoostReceiver {
    governor: Arc<FrameAwareGovernor>,
    cpu: usize,
    threshold_us: u32,
}

impl FrameBoostReceiver {
    pub fn new(governor: Arc<FrameAwareGovernor>, cpu: usize, threshold_us: u32) -> Self {
        Self {
            governor,
            cpu,
            threshold_us,
        }
    }
}

impl JankReceiver for FrameBoostReceiver {
    fn jank_threshold_us(&self) -> u32 {
        self.threshold_us
    }

    fn on_jank_frame(&self, frame_time_us: u32, now: u64) {
        self.governor.on_jank_frame(self.cpu, frame_time_us, now);
    }
}

/// 帧耗时分发器
#[derive(Default)]
pub struct FrameMonitor {
    receivers: RwLock<Vec<Arc<dyn JankReceiver>>>,
}

impl FrameMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, receiver: Arc<dyn JankReceiver>) {
        if let Ok(mut receivers) = self.receivers.write() {
            receivers.push(receiver);
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.read().map(|r| r.len()).unwrap_or(0)
    }

    /// 分发一帧，返回被回调的接收者数量
    pub fn dispatch(&self, frame_time_us: u32, now: u64) -> usize {
        let Ok(receivers) = self.receivers.read() else {
            return 0;
        };
        let mut notified = 0;
        for receiver in receivers.iter() {
            if frame_time_us >= receiver.jank_threshold_us() {
                receiver.on_jank_frame(frame_time_us, now);
                notified += 1;
            }
        }
        notified
    }
}

/// 解析 `<frame_time_us> [timestamp_ns]`
pub fn parse_frame_line(line: &str) -> Option<(u32, Option<u64>)> {
    let mut fields = line.split_whitespace();
    let frame_time = fields.next()?.parse::<u32>().ok()?;
    let timestamp = match fields.next() {
        Some(ts) => Some(ts.parse::<u64>().ok()?),
        None => None,
    };
    Some((frame_time, timestamp))
}

/// 从 reader 中读取帧数据直到 EOF，返回处理的行数
pub fn consume_frames<R: BufRead>(reader: R, monitor: &FrameMonitor) -> Result<usize> {
    let mut frames = 0;
    for line in reader.lines() {
        let line = line.context("Failed to read frame time")?;
        let Some((frame_time, timestamp)) = parse_frame_line(&line) else {
            if !line.trim().is_empty() {
                debug!("Ignoring malformed frame line: {line:?}");
            }
            continue;
        };
        let now = timestamp.unwrap_or_else(monotonic_ns);
        monitor.dispatch(frame_time, now);
        frames += 1;
    }
    Ok(frames)
}

pub fn monitor_frames<P: AsRef<Path>>(path: P, monitor: Arc<FrameMonitor>) -> Result<()> {
    let path = path.as_ref();
    info!("{FRAME_THREAD} Start: {}", path.display());

    loop {
        // FIFO 在写端打开前会阻塞
        match File::open(path) {
            Ok(file) => match consume_frames(BufReader::new(file), &monitor) {
                Ok(n) => debug!("Frame source closed after {n} frames"),
                Err(e) => warn!("Frame source error: {e:#}"),
            },
            Err(e) => debug!("Frame source {} unavailable: {e}", path.display()),
        }
        thread::sleep(Duration::from_millis(REOPEN_DELAY_MS));
    }
}
