use std::{
    sync::{Arc, Condvar, Mutex, mpsc},
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, warn};

use crate::model::{frequency_table::Relation, policy::PolicyId};

/// 硬件频率驱动
pub trait CpufreqDriver: Send + Sync {
    fn name(&self) -> &str;

    /// 同步切换，不允许阻塞；失败返回 None
    fn fast_switch(&self, policy: PolicyId, freq: u32) -> Option<u32>;

    /// 阻塞式切换，返回实际生效的频率
    fn target(&self, policy: PolicyId, freq: u32, relation: Relation) -> Result<u32>;

    /// 下发策略的 min/max 限制
    fn apply_limits(&self, policy: PolicyId, min: u32, max: u32) -> Result<()>;
}

/// 一次提交的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// 已同步生效
    Applied(u32),
    /// 已交给工作线程
    Queued,
    /// 驱动拒绝
    Failed,
}

/// 频率执行器：把解析好的频率下发到硬件
pub trait FrequencyActuator: Send + Sync {
    fn is_fast(&self) -> bool;

    fn commit(&self, freq: u32) -> Commit;

    fn apply_limits(&self, min: u32, max: u32) -> Result<()>;

    /// 等待已排队的切换完成
    fn flush(&self);

    /// 停止后台资源，可重复调用
    fn shutdown(&self);
}

/// 快速切换：在调度上下文中直接调用驱动
pub struct FastSwitchActuator {
    policy: PolicyId,
    driver: Arc<dyn CpufreqDriver>,
}

impl FastSwitchActuator {
    pub fn new(policy: PolicyId, driver: Arc<dyn CpufreqDriver>) -> Self {
        Self { policy, driver }
    }
}

impl FrequencyActuator for FastSwitchActuator {
    fn is_fast(&self) -> bool {
        true
    }

    fn commit(&self, freq: u32) -> Commit {
        match self.driver.fast_switch(self.policy, freq) {
            Some(f) if f > 0 => {
                debug!("policy{} fast switch -> {f}KHz", self.policy);
                Commit::Applied(f)
            }
            _ => {
                debug!("policy{} fast switch to {freq}KHz failed", self.policy);
                Commit::Failed
            }
        }
    }

    fn apply_limits(&self, min: u32, max: u32) -> Result<()> {
        self.driver.apply_limits(self.policy, min, max)
    }

    fn flush(&self) {}

    fn shutdown(&self) {}
}

/// 工作线程配置
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// SCHED_FIFO 优先级，None 表示保持普通调度
    pub rt_priority: Option<i32>,
    /// 绑定的 CPU，空表示不绑定
    pub cpus: Vec<usize>,
}

#[derive(Default)]
struct WorkInner {
    pending: Option<u32>,
    in_progress: bool,
    stop: bool,
}

struct WorkState {
    inner: Mutex<WorkInner>,
    cond: Condvar,
    /// 串行化阻塞切换与 limits 下发
    work_lock: Mutex<()>,
}

type AppliedCallback = Box<dyn Fn(u32) + Send + Sync>;

/// 慢速切换：交给专用实时线程执行阻塞式切换
pub struct DeferredActuator {
    policy: PolicyId,
    driver: Arc<dyn CpufreqDriver>,
    state: Arc<WorkState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredActuator {
    /// 创建并启动工作线程；线程创建或调度策略设置失败时返回错误
    pub fn spawn(
        policy: PolicyId,
        first_cpu: usize,
        driver: Arc<dyn CpufreqDriver>,
        opts: WorkerOptions,
        on_applied: AppliedCallback,
    ) -> Result<Self> {
        let state = Arc::new(WorkState {
            inner: Mutex::new(WorkInner::default()),
            cond: Condvar::new(),
            work_lock: Mutex::new(()),
        });

        let name = format!("fagov:{first_cpu}");
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let worker_state = Arc::clone(&state);
        let worker_driver = Arc::clone(&driver);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let setup = setup_worker_thread(&opts);
                let ok = setup.is_ok();
                let _ = ready_tx.send(setup);
                if ok {
                    worker_loop(policy, &worker_state, worker_driver.as_ref(), &on_applied);
                }
            })
            .with_context(|| format!("Failed to create worker thread {name}"))?;

        let setup = ready_rx
            .recv()
            .map_err(|_| anyhow!("Worker thread {name} exited during setup"))
            .and_then(|r| r);
        if let Err(e) = setup {
            let _ = handle.join();
            return Err(e.context(format!("Failed to start worker thread {name}")));
        }

        info!("{name} started for policy{policy}");
        Ok(Self {
            policy,
            driver,
            state,
            handle: Mutex::new(Some(handle)),
        })
    }
}

fn setup_worker_thread(opts: &WorkerOptions) -> Result<()> {
    if let Some(priority) = opts.rt_priority {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error()).context("Failed to set SCHED_FIFO");
        }
    }

    if !opts.cpus.is_empty() {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for &cpu in &opts.cpus {
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
        let ret =
            unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to bind worker to CPUs {:?}", opts.cpus));
        }
    }

    Ok(())
}

fn worker_loop(
    policy: PolicyId,
    state: &WorkState,
    driver: &dyn CpufreqDriver,
    on_applied: &AppliedCallback,
) {
    loop {
        let freq = {
            let Ok(mut inner) = state.inner.lock() else {
                error!("policy{policy} worker state poisoned");
                return;
            };
            loop {
                if inner.stop {
                    inner.in_progress = false;
                    state.cond.notify_all();
                    return;
                }
                if let Some(freq) = inner.pending.take() {
                    inner.in_progress = true;
                    break freq;
                }
                inner = match state.cond.wait(inner) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
        };

        {
            let _work = state.work_lock.lock();
            match driver.target(policy, freq, Relation::Low) {
                Ok(applied) => {
                    debug!("policy{policy} deferred switch -> {applied}KHz");
                    on_applied(applied);
                }
                Err(e) => warn!("policy{policy} deferred switch to {freq}KHz failed: {e}"),
            }
        }

        if let Ok(mut inner) = state.inner.lock() {
            inner.in_progress = false;
            state.cond.notify_all();
        }
    }
}

impl FrequencyActuator for DeferredActuator {
    fn is_fast(&self) -> bool {
        false
    }

    fn commit(&self, freq: u32) -> Commit {
        let Ok(mut inner) = self.state.inner.lock() else {
            return Commit::Failed;
        };
        if inner.stop {
            return Commit::Failed;
        }
        // 未处理的旧请求直接被新请求覆盖
        inner.pending = Some(freq);
        self.state.cond.notify_all();
        Commit::Queued
    }

    fn apply_limits(&self, min: u32, max: u32) -> Result<()> {
        let _work = self
            .state
            .work_lock
            .lock()
            .map_err(|_| anyhow!("policy{} work lock poisoned", self.policy))?;
        self.driver.apply_limits(self.policy, min, max)
    }

    fn flush(&self) {
        let Ok(mut inner) = self.state.inner.lock() else {
            return;
        };
        while !inner.stop && (inner.pending.is_some() || inner.in_progress) {
            inner = match self.state.cond.wait(inner) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }

    fn shutdown(&self) {
        if let Ok(mut inner) = self.state.inner.lock() {
            inner.stop = true;
            inner.pending = None;
            self.state.cond.notify_all();
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("policy{} worker thread panicked", self.policy);
            }
            debug!("policy{} worker stopped", self.policy);
        }
    }
}

impl Drop for DeferredActuator {
    fn drop(&mut self) {
        self.shutdown();
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::{mock::MockDriver, *};

    #[test]
    fn fast_switch_applies_synchronously() {
        let driver = Arc::new(MockDriver::default());
        let act = FastSwitchActuator::new(0, driver.clone());
        assert!(act.is_fast());
        assert_eq!(act.commit(1_000_000), Commit::Applied(1_000_000));
        assert_eq!(*driver.fast_calls.lock().unwrap(), vec![1_000_000]);
    }

    #[test]
    fn fast_switch_failure_is_reported() {
        let driver = Arc::new(MockDriver {
            fail_fast: true,
            ..Default::default()
        });
        let act = FastSwitchActuator::new(0, driver);
        assert_eq!(act.commit(1_000_000), Commit::Failed);
    }

    #[test]
    fn deferred_worker_applies_and_reports() {
        let driver = Arc::new(MockDriver::default());
        let applied = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&applied);
        let act = DeferredActuator::spawn(
            3,
            6,
            driver.clone(),
            WorkerOptions::default(),
            Box::new(move |f| seen.store(f, Ordering::SeqCst)),
        )
        .unwrap();

        assert_eq!(act.commit(1_500_000), Commit::Queued);
        act.flush();
        assert_eq!(applied.load(Ordering::SeqCst), 1_500_000);
        assert_eq!(driver.target_calls.lock().unwrap().last(), Some(&1_500_000));

        act.apply_limits(300_000, 1_800_000).unwrap();
        assert_eq!(*driver.limits.lock().unwrap(), vec![(300_000, 1_800_000)]);

        act.shutdown();
        act.shutdown();
        assert_eq!(act.commit(1_000_000), Commit::Failed);
    }

    #[test]
    fn invalid_affinity_fails_spawn() {
        let driver = Arc::new(MockDriver::default());
        let opts = WorkerOptions {
            rt_priority: None,
            cpus: vec![libc::CPU_SETSIZE as usize - 1],
        };
        let res = DeferredActuator::spawn(0, 0, driver, opts, Box::new(|_| {}));
        assert!(res.is_err());
    }
}
