use std::{collections::HashMap, path::{Path, PathBuf}, thread, time::Duration};

use anyhow::{Context, Result};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use log::{debug, warn};

/// 文件被替换后等待新文件出现的时间
const WAIT_RECREATE_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub mask: EventMask,
}

/// 监控单个文件；编辑器整体替换文件后自动重新建立监控
pub struct InotifyWatcher {
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, (PathBuf, WatchMask)>,
}

impl InotifyWatcher {
    pub fn new() -> Result<Self> {
        let inotify = Inotify::init().with_context(|| "Failed to initialize inotify")?;

        Ok(Self {
            inotify,
            watches: HashMap::new(),
        })
    }

    pub fn add<P: AsRef<Path>>(&mut self, path: P, mask: WatchMask) -> Result<()> {
        let path = path.as_ref();
        let mask = mask | WatchMask::DELETE_SELF | WatchMask::MOVE_SELF;

        let wd = self
            .inotify
            .watches()
            .add(path, mask)
            .with_context(|| format!("Failed to add watch for: {}", path.display()))?;

        self.watches.insert(wd, (path.to_path_buf(), mask));
        Ok(())
    }

    /// 阻塞等待事件
    pub fn wait_and_handle(&mut self) -> Result<Vec<WatchEvent>> {
        let mut buffer = [0; 4096];
        let mut events = Vec::new();
        let mut lost = Vec::new();

        for event in self
            .inotify
            .read_events_blocking(&mut buffer)
            .with_context(|| "Failed to read inotify events")?
        {
            let Some((path, mask)) = self.watches.get(&event.wd) else {
                continue;
            };
            if event
                .mask
                .intersects(EventMask::IGNORED | EventMask::DELETE_SELF | EventMask::MOVE_SELF)
            {
                lost.push((event.wd.clone(), path.clone(), *mask));
            }
            events.push(WatchEvent {
                path: path.clone(),
                mask: event.mask,
            });
        }

        for (wd, path, mask) in lost {
            self.rewatch(wd, &path, mask)?;
        }

        Ok(events)
    }

    fn rewatch(&mut self, old: WatchDescriptor, path: &Path, mask: WatchMask) -> Result<()> {
        if self.watches.remove(&old).is_none() {
            return Ok(());
        }
        if !path.exists() {
            thread::sleep(Duration::from_millis(WAIT_RECREATE_MS));
        }

        match self.inotify.watches().add(path, mask) {
            Ok(wd) => {
                debug!("Re-watching {}", path.display());
                self.watches.insert(wd, (path.to_path_buf(), mask));
                Ok(())
            }
            Err(e) => {
                warn!("{} disappeared: {e}", path.display());
                Err(e).with_context(|| format!("Failed to re-add watch for: {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn reports_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "a").unwrap();

        let mut watcher = InotifyWatcher::new().unwrap();
        watcher.add(&path, WatchMask::CLOSE_WRITE | WatchMask::MODIFY).unwrap();
        fs::write(&path, "b").unwrap();

        let events = watcher.wait_and_handle().unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.path == path));
    }

    #[test]
    fn missing_file_cannot_be_watched() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = InotifyWatcher::new().unwrap();
        assert!(watcher.add(dir.path().join("nope"), WatchMask::MODIFY).is_err());
    }
}
