use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};

use crate::{
    model::{
        actuator::{
            Commit, CpufreqDriver, DeferredActuator, FastSwitchActuator, FrequencyActuator,
            WorkerOptions,
        },
        frame_boost::{BoostContext, FrameBoostQueue, FrameTimeStats, calc_frame_boost},
        policy::{CpuState, CpufreqPolicy, PolicyId},
        rate_limiter::{RateLimiter, UpdateFlags},
        resolver::{ResolveRequest, get_next_freq},
        sampler::{
            CpuSample, CycleTracker, LoadTracking, SamplerFeatures, WaltContext,
            effective_cpu_util, target_util, walt_adjust,
        },
        tunables::{Tunables, TunablesUpdate},
    },
    utils::constants::{
        SCHED_CAPACITY_SCALE,
        strategy::{DEFAULT_WALT_WINDOW_NS, WORKER_RT_PRIORITY},
    },
};

/// 调速器生命周期
pub trait CpufreqGovernor {
    fn name(&self) -> &'static str;

    /// 为策略分配状态、可调参数与执行器
    fn init(&self, policy: CpufreqPolicy) -> Result<()>;

    /// 重置状态并挂接到策略的所有 CPU
    fn start(&self, id: PolicyId) -> Result<()>;

    /// 解除挂接并等待进行中的切换完成
    fn stop(&self, id: PolicyId) -> Result<()>;

    /// 策略 min/max 变化
    fn limits(&self, id: PolicyId, min: u32, max: u32) -> Result<()>;

    /// 释放策略的全部资源
    fn exit(&self, id: PolicyId) -> Result<()>;
}

/// 调速器运行选项 (非运行时可调)
#[derive(Debug, Clone)]
pub struct GovernorOptions {
    /// 每个策略独立一份可调参数，否则全局共享
    pub per_policy_tunables: bool,
    pub load_tracking: LoadTracking,
    pub features: SamplerFeatures,
    pub walt_window_ns: u64,
    /// 慢速切换线程的 SCHED_FIFO 优先级
    pub worker_rt_priority: Option<i32>,
    /// 慢速切换线程是否绑定到策略的 CPU
    pub bind_worker: bool,
}

impl Default for GovernorOptions {
    fn default() -> Self {
        Self {
            per_policy_tunables: true,
            load_tracking: LoadTracking::Pelt,
            features: SamplerFeatures::default(),
            walt_window_ns: DEFAULT_WALT_WINDOW_NS,
            worker_rt_priority: Some(WORKER_RT_PRIORITY),
            bind_worker: true,
        }
    }
}

/// 策略状态的只读快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub id: PolicyId,
    pub cur: u32,
    pub min: u32,
    pub max: u32,
    pub next_freq: u32,
    /// 最近一次提交频率的时间
    pub last_update: u64,
    pub pending_boosts: usize,
}

/// 更新路径上使用的可调参数副本
#[derive(Debug, Clone, Copy)]
struct TunablesView {
    pl: bool,
    hispeed_load: u32,
    hispeed_freq: u32,
    rtg_boost_freq: u32,
    frame_aware: bool,
    frame_freq: u32,
}

impl From<&Tunables> for TunablesView {
    fn from(t: &Tunables) -> Self {
        Self {
            pl: t.pl,
            hispeed_load: t.hispeed_load,
            hispeed_freq: t.hispeed_freq,
            rtg_boost_freq: t.rtg_boost_freq,
            frame_aware: t.frame_aware,
            frame_freq: t.frame_freq,
        }
    }
}

/// 受策略更新锁保护的全部状态
struct PolicyData {
    policy: CpufreqPolicy,
    limiter: RateLimiter,
    boosts: FrameBoostQueue,
    cpus: Vec<CpuState>,
    cycles: CycleTracker,
    frame_stats: FrameTimeStats,
    max: u64,
    hispeed_util: u64,
    rtg_boost_util: u64,
}

impl PolicyData {
    fn new(policy: CpufreqPolicy, tunables: &Tunables) -> Self {
        let cpus = policy
            .cpus()
            .iter()
            .map(|&cpu| CpuState::new(cpu))
            .collect();
        let mut data = Self {
            limiter: RateLimiter::new(tunables.up_rate_delay_ns(), tunables.down_rate_delay_ns()),
            boosts: FrameBoostQueue::new(),
            cpus,
            cycles: CycleTracker::default(),
            frame_stats: FrameTimeStats::default(),
            max: SCHED_CAPACITY_SCALE,
            hispeed_util: 0,
            rtg_boost_util: 0,
            policy,
        };
        data.update_target_utils(tunables.hispeed_freq, tunables.rtg_boost_freq);
        data
    }

    fn cpu_index(&self, cpu: usize) -> Option<usize> {
        self.policy.cpus().iter().position(|&c| c == cpu)
    }

    fn update_target_utils(&mut self, hispeed_freq: u32, rtg_boost_freq: u32) {
        let cpuinfo_max = self.policy.get_cpuinfo_max();
        self.hispeed_util = target_util(self.max, hispeed_freq, cpuinfo_max);
        self.rtg_boost_util = target_util(self.max, rtg_boost_freq, cpuinfo_max);
    }

    /// 策略启动时清空采样与限速状态
    fn reset(&mut self, tunables: &Tunables) {
        self.limiter
            .set_delays(tunables.up_rate_delay_ns(), tunables.down_rate_delay_ns());
        self.limiter.reset();
        self.boosts.clear();
        self.cycles = CycleTracker::default();
        self.cpus = self
            .policy
            .cpus()
            .iter()
            .map(|&cpu| CpuState::new(cpu))
            .collect();
    }

    /// 记录一次采样，返回该 CPU 自上次以来是否一直忙碌
    fn record_sample(
        &mut self,
        idx: usize,
        time: u64,
        sample: &CpuSample,
        view: &TunablesView,
        opts: &GovernorOptions,
    ) -> bool {
        let max = if sample.max_capacity == 0 {
            SCHED_CAPACITY_SCALE
        } else {
            sample.max_capacity
        };
        if max != self.max {
            self.max = max;
            self.update_target_utils(view.hispeed_freq, view.rtg_boost_freq);
        }

        let single = !self.policy.is_shared();
        let state = &mut self.cpus[idx];

        // DL 带宽上升必须立即响应
        if sample.util.dl_bw > state.bw_dl {
            self.limiter.mark_limits_changed();
        }
        state.bw_dl = sample.util.dl_bw;
        state.util = effective_cpu_util(&sample.util, max, &opts.features);
        state.max = max;
        state.walt = sample.walt;
        state.last_update = time;
        let busy = single && state.is_busy(sample.idle_calls);

        if opts.load_tracking == LoadTracking::Walt {
            self.cycles.calc_avg_cap(
                sample.walt.ws,
                self.policy.get_cur(),
                opts.walt_window_ns,
                max,
                self.policy.get_cpuinfo_max(),
            );
        }

        busy
    }

    /// 聚合利用率并决定是否提交新频率
    fn decide(
        &mut self,
        idx: usize,
        time: u64,
        flags: UpdateFlags,
        busy: bool,
        view: &TunablesView,
        opts: &GovernorOptions,
        actuator: &dyn FrequencyActuator,
    ) {
        if !self.limiter.should_update(time, flags) {
            return;
        }

        let walt = (opts.load_tracking == LoadTracking::Walt).then(|| WaltContext {
            avg_cap: self.cycles.avg_cap(),
            hispeed_util: self.hispeed_util,
            rtg_boost_util: self.rtg_boost_util,
            hispeed_load: view.hispeed_load,
            pl_enabled: view.pl,
            conservative_pl: opts.features.conservative_pl,
        });
        let migration = flags.contains(UpdateFlags::INTERCLUSTER_MIG);

        let (util, max) = if !self.policy.is_shared() {
            let state = &self.cpus[idx];
            let (mut util, mut max) = (state.util, state.max);
            if let Some(ctx) = &walt {
                walt_adjust(ctx, state.util, &state.walt, migration, &mut util, &mut max);
            }
            (util, max)
        } else {
            // 共享策略取 util/max 比值最高的 CPU；相等时也替换，避免 max 停留在 1
            let (mut util, mut max) = (0, 1);
            for state in &self.cpus {
                if state.util * max >= util * state.max {
                    util = state.util;
                    max = state.max;
                    debug!(
                        "policy{}: cpu{} util={util}/{max} sampled at {}",
                        self.policy.id(),
                        state.cpu,
                        state.last_update
                    );
                }
                if let Some(ctx) = &walt {
                    walt_adjust(ctx, state.util, &state.walt, migration, &mut util, &mut max);
                }
            }
            (util, max)
        };

        let busy = busy
            && opts.load_tracking == LoadTracking::Pelt
            && !self.limiter.need_freq_update();

        let req = ResolveRequest {
            util,
            max,
            time,
            frame_aware: view.frame_aware,
            frame_freq: view.frame_freq,
        };
        let mut next_f = get_next_freq(&self.policy, &mut self.limiter, &mut self.boosts, &req);

        // 一直忙碌的 CPU 不降频
        if busy && next_f < self.limiter.next_freq() {
            next_f = self.limiter.next_freq();
            self.limiter.restore_cached_raw();
        }

        self.commit(time, next_f, flags, opts, actuator);
    }

    fn commit(
        &mut self,
        time: u64,
        next_f: u32,
        flags: UpdateFlags,
        opts: &GovernorOptions,
        actuator: &dyn FrequencyActuator,
    ) {
        let prev = self.policy.get_cur();
        if !self.limiter.update_next_freq(time, next_f, flags) {
            return;
        }

        if opts.load_tracking == LoadTracking::Walt {
            self.cycles.track_cycles(prev, time, opts.walt_window_ns);
        }

        match actuator.commit(next_f) {
            Commit::Applied(freq) => self.policy.set_cur(freq),
            Commit::Queued => {}
            Commit::Failed => warn!("policy{}: failed to commit {next_f}KHz", self.policy.id()),
        }
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            id: self.policy.id(),
            cur: self.policy.get_cur(),
            min: self.policy.get_min(),
            max: self.policy.get_max(),
            next_freq: self.limiter.next_freq(),
            last_update: self.limiter.last_freq_update_time(),
            pending_boosts: self.boosts.len(),
        }
    }
}

/// 已初始化的策略
pub struct PolicyHandle {
    id: PolicyId,
    cpus: Vec<usize>,
    data: Arc<Mutex<PolicyData>>,
    tunables: Arc<RwLock<Tunables>>,
    actuator: Box<dyn FrequencyActuator>,
}

impl PolicyHandle {
    fn lock(&self) -> Result<MutexGuard<'_, PolicyData>> {
        self.data
            .lock()
            .map_err(|_| anyhow!("policy{} update lock poisoned", self.id))
    }

    fn view(&self) -> Option<TunablesView> {
        self.tunables.read().ok().map(|t| TunablesView::from(&*t))
    }
}

#[derive(Default)]
struct TunablesRegistry {
    global: Option<Arc<RwLock<Tunables>>>,
    global_users: usize,
    global_cached: Option<Tunables>,
    cached: HashMap<PolicyId, Tunables>,
}

/// 帧感知调速器
pub struct FrameAwareGovernor {
    driver: Arc<dyn CpufreqDriver>,
    options: GovernorOptions,
    policies: RwLock<HashMap<PolicyId, Arc<PolicyHandle>>>,
    /// 按 CPU 号索引的已挂接策略
    hooked: RwLock<Vec<Option<Arc<PolicyHandle>>>>,
    tunables: Mutex<TunablesRegistry>,
}

impl FrameAwareGovernor {
    pub fn new(driver: Arc<dyn CpufreqDriver>, options: GovernorOptions) -> Self {
        info!(
            "Governor created: driver={} load_tracking={:?} per_policy_tunables={}",
            driver.name(),
            options.load_tracking,
            options.per_policy_tunables
        );
        Self {
            driver,
            options,
            policies: RwLock::new(HashMap::new()),
            hooked: RwLock::new(Vec::new()),
            tunables: Mutex::new(TunablesRegistry::default()),
        }
    }

    pub fn options(&self) -> &GovernorOptions {
        &self.options
    }

    fn handle(&self, id: PolicyId) -> Result<Arc<PolicyHandle>> {
        self.policies
            .read()
            .map_err(|_| anyhow!("policy registry poisoned"))?
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("policy{id} is not initialized"))
    }

    pub fn policy_ids(&self) -> Vec<PolicyId> {
        let mut ids: Vec<PolicyId> = self
            .policies
            .read()
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self, id: PolicyId) -> Option<PolicySnapshot> {
        let handle = self.handle(id).ok()?;
        let data = handle.lock().ok()?;
        Some(data.snapshot())
    }

    /// 调度器事件入口：记录采样并在允许时重新选频
    pub fn update_util(&self, cpu: usize, time: u64, sample: &CpuSample, flags: UpdateFlags) {
        // 持有读锁直到本次更新结束，stop 以写锁等待进行中的更新
        let Ok(hooked) = self.hooked.read() else {
            return;
        };
        let Some(handle) = hooked.get(cpu).and_then(Option::as_ref) else {
            return;
        };
        let Some(view) = handle.view() else {
            return;
        };

        if flags.contains(UpdateFlags::PL) && !view.pl {
            return;
        }

        let Ok(mut data) = handle.lock() else {
            return;
        };
        let Some(idx) = data.cpu_index(cpu) else {
            return;
        };

        let busy = data.record_sample(idx, time, sample, &view, &self.options);
        if flags.contains(UpdateFlags::CONTINUE) {
            return;
        }

        data.decide(
            idx,
            time,
            flags,
            busy,
            &view,
            &self.options,
            handle.actuator.as_ref(),
        );
    }

    /// 卡顿帧入口：为 CPU 所属策略追加加速请求并立即重新选频
    pub fn on_jank_frame(&self, cpu: usize, frame_time_us: u32, now: u64) {
        let Ok(hooked) = self.hooked.read() else {
            return;
        };
        let Some(handle) = hooked.get(cpu).and_then(Option::as_ref) else {
            debug!("cpu{cpu} is not governed, frame boost dropped");
            return;
        };
        let Some(view) = handle.view() else {
            return;
        };
        if !view.frame_aware {
            debug!("policy{} frame aware disabled, frame boost dropped", handle.id);
            return;
        }

        let Ok(mut guard) = handle.lock() else {
            return;
        };
        let data = &mut *guard;
        let Some(idx) = data.cpu_index(cpu) else {
            return;
        };

        let boost = {
            let first = &data.cpus[0];
            let ctx = BoostContext {
                cur_freq: data.policy.get_cur(),
                cpuinfo_max: data.policy.get_cpuinfo_max(),
                frame_freq: view.frame_freq,
                load: first.util,
                capacity: first.max.max(1),
                table: data.policy.table(),
            };
            calc_frame_boost(&ctx, frame_time_us, now)
        };
        data.boosts.push(boost);
        let avg = data.frame_stats.record(frame_time_us);
        debug!(
            "policy{} jank frame #{}: {frame_time_us}us (avg {avg}us), {} boosts pending",
            handle.id,
            data.frame_stats.frame_count(),
            data.boosts.len()
        );

        data.decide(
            idx,
            now,
            UpdateFlags::SKIP_LIMITS,
            false,
            &view,
            &self.options,
            handle.actuator.as_ref(),
        );
    }

    fn all_handles(&self) -> Result<Vec<Arc<PolicyHandle>>> {
        Ok(self
            .policies
            .read()
            .map_err(|_| anyhow!("policy registry poisoned"))?
            .values()
            .cloned()
            .collect())
    }

    /// 刷新共享同一份参数的所有策略的派生状态
    fn refresh_derived(&self, tunables: &Arc<RwLock<Tunables>>, update: &TunablesUpdate) -> Result<()> {
        let current = tunables
            .read()
            .map_err(|_| anyhow!("tunables poisoned"))?
            .clone();

        for handle in self
            .all_handles()?
            .iter()
            .filter(|h| Arc::ptr_eq(&h.tunables, tunables))
        {
            let mut data = handle.lock()?;
            if update.touches_rate_limits() {
                data.limiter
                    .set_delays(current.up_rate_delay_ns(), current.down_rate_delay_ns());
                debug!(
                    "policy{} rate limit floor {}ns",
                    handle.id,
                    data.limiter.min_rate_limit_ns()
                );
            }
            if update.touches_target_utils() {
                data.update_target_utils(current.hispeed_freq, current.rtg_boost_freq);
            }
            debug!("policy{} tunables updated: {update:?}", handle.id);
        }
        Ok(())
    }

    /// 应用参数更新；`None` 表示所有策略
    pub fn update_tunables(&self, id: Option<PolicyId>, update: &TunablesUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let targets = match id {
            Some(id) => vec![self.handle(id)?],
            None => self.all_handles()?,
        };

        let _registry = self
            .tunables
            .lock()
            .map_err(|_| anyhow!("tunables registry poisoned"))?;

        let mut touched: Vec<Arc<RwLock<Tunables>>> = Vec::new();
        for handle in &targets {
            if touched.iter().any(|t| Arc::ptr_eq(t, &handle.tunables)) {
                continue;
            }
            handle
                .tunables
                .write()
                .map_err(|_| anyhow!("policy{} tunables poisoned", handle.id))?
                .apply(update);
            touched.push(Arc::clone(&handle.tunables));
        }

        for tunables in &touched {
            self.refresh_derived(tunables, update)?;
        }
        Ok(())
    }

    /// 按属性名写入单个参数，非法输入被拒绝且原值保留
    pub fn store_tunable(&self, id: PolicyId, attr: &str, text: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let _registry = self
            .tunables
            .lock()
            .map_err(|_| anyhow!("tunables registry poisoned"))?;

        let stored = handle
            .tunables
            .write()
            .map_err(|_| anyhow!("policy{id} tunables poisoned"))?
            .store(attr, text);
        let update = match stored {
            Ok(update) => update,
            Err(e) => {
                warn!("policy{id}: rejected {attr}={:?}: {e}", text.trim());
                return Err(e);
            }
        };
        self.refresh_derived(&handle.tunables, &update)
    }

    pub fn show_tunable(&self, id: PolicyId, attr: &str) -> Result<String> {
        let handle = self.handle(id)?;
        let tunables = handle
            .tunables
            .read()
            .map_err(|_| anyhow!("policy{id} tunables poisoned"))?;
        tunables.show(attr)
    }

    fn acquire_tunables(&self, policy: &CpufreqPolicy) -> Result<Arc<RwLock<Tunables>>> {
        let id = policy.id();
        let mut reg = self
            .tunables
            .lock()
            .map_err(|_| anyhow!("tunables registry poisoned"))?;

        if !self.options.per_policy_tunables {
            if let Some(global) = &reg.global {
                let global = Arc::clone(global);
                reg.global_users += 1;
                return Ok(global);
            }
            let tunables = reg
                .global_cached
                .take()
                .unwrap_or_else(|| Tunables::defaults_for(policy.cluster()));
            let global = Arc::new(RwLock::new(tunables));
            reg.global = Some(Arc::clone(&global));
            reg.global_users = 1;
            return Ok(global);
        }

        let tunables = match reg.cached.get(&id) {
            Some(cached) => {
                info!("policy{id}: restored cached tunables");
                cached.clone()
            }
            None => Tunables::defaults_for(policy.cluster()),
        };
        Ok(Arc::new(RwLock::new(tunables)))
    }

    fn release_tunables(&self, id: PolicyId, tunables: &Arc<RwLock<Tunables>>, save: bool) {
        let Ok(mut reg) = self.tunables.lock() else {
            return;
        };
        let snapshot = tunables.read().ok().map(|t| t.clone());

        if self.options.per_policy_tunables {
            if save && let Some(t) = snapshot {
                reg.cached.insert(id, t);
            }
            return;
        }

        reg.global_users = reg.global_users.saturating_sub(1);
        if reg.global_users == 0 {
            reg.global = None;
            if save {
                reg.global_cached = snapshot;
            }
        }
    }

    fn create_actuator(
        &self,
        data: &Arc<Mutex<PolicyData>>,
        policy: &CpufreqPolicy,
    ) -> Result<Box<dyn FrequencyActuator>> {
        let id = policy.id();
        if policy.get_fast_switch_enabled() {
            return Ok(Box::new(FastSwitchActuator::new(id, Arc::clone(&self.driver))));
        }

        let opts = WorkerOptions {
            rt_priority: self.options.worker_rt_priority,
            cpus: if self.options.bind_worker {
                policy.cpus().to_vec()
            } else {
                Vec::new()
            },
        };
        let weak = Arc::downgrade(data);
        let actuator = DeferredActuator::spawn(
            id,
            policy.first_cpu(),
            Arc::clone(&self.driver),
            opts,
            Box::new(move |freq| {
                if let Some(data) = weak.upgrade()
                    && let Ok(mut data) = data.lock()
                {
                    data.policy.set_cur(freq);
                }
            }),
        )?;
        Ok(Box::new(actuator))
    }
}

impl CpufreqGovernor for FrameAwareGovernor {
    fn name(&self) -> &'static str {
        "frame_aware"
    }

    fn init(&self, policy: CpufreqPolicy) -> Result<()> {
        let id = policy.id();
        if self.handle(id).is_ok() {
            bail!("policy{id} is busy: governor already initialized");
        }

        let tunables = self.acquire_tunables(&policy)?;
        let cpus = policy.cpus().to_vec();
        let data = {
            let t = tunables
                .read()
                .map_err(|_| anyhow!("policy{id} tunables poisoned"))?;
            Arc::new(Mutex::new(PolicyData::new(policy.clone(), &t)))
        };

        let actuator = match self.create_actuator(&data, &policy) {
            Ok(actuator) => actuator,
            Err(e) => {
                self.release_tunables(id, &tunables, false);
                return Err(e).with_context(|| format!("Failed to init policy{id}"));
            }
        };

        let handle = Arc::new(PolicyHandle {
            id,
            cpus,
            data,
            tunables,
            actuator,
        });

        let mut policies = self
            .policies
            .write()
            .map_err(|_| anyhow!("policy registry poisoned"))?;
        if policies.contains_key(&id) {
            drop(policies);
            handle.actuator.shutdown();
            self.release_tunables(id, &handle.tunables, false);
            bail!("policy{id} is busy: governor already initialized");
        }
        policies.insert(id, handle);

        info!(
            "policy{id} initialized: cpus={:?} fast_switch={}",
            policy.cpus(),
            policy.get_fast_switch_enabled()
        );
        Ok(())
    }

    fn start(&self, id: PolicyId) -> Result<()> {
        let handle = self.handle(id)?;
        let mut hooked = self
            .hooked
            .write()
            .map_err(|_| anyhow!("cpu hook table poisoned"))?;

        let already = handle.cpus.iter().all(|&cpu| {
            hooked
                .get(cpu)
                .and_then(Option::as_ref)
                .is_some_and(|h| Arc::ptr_eq(h, &handle))
        });
        if already {
            debug!("policy{id} already started");
            return Ok(());
        }

        {
            let tunables = handle
                .tunables
                .read()
                .map_err(|_| anyhow!("policy{id} tunables poisoned"))?
                .clone();
            handle.lock()?.reset(&tunables);
        }

        for &cpu in &handle.cpus {
            if hooked.len() <= cpu {
                hooked.resize(cpu + 1, None);
            }
            hooked[cpu] = Some(Arc::clone(&handle));
        }

        info!("policy{id} started on cpus {:?}", handle.cpus);
        Ok(())
    }

    fn stop(&self, id: PolicyId) -> Result<()> {
        let handle = self.handle(id)?;

        let unhooked = {
            let mut hooked = self
                .hooked
                .write()
                .map_err(|_| anyhow!("cpu hook table poisoned"))?;
            let mut any = false;
            for &cpu in &handle.cpus {
                if let Some(slot) = hooked.get_mut(cpu)
                    && slot.as_ref().is_some_and(|h| Arc::ptr_eq(h, &handle))
                {
                    *slot = None;
                    any = true;
                }
            }
            any
        };
        if !unhooked {
            debug!("policy{id} already stopped");
            return Ok(());
        }

        handle.actuator.flush();

        let mut data = handle.lock()?;
        let purged = data.boosts.len();
        data.boosts.clear();
        info!("policy{id} stopped, {purged} frame boosts purged");
        Ok(())
    }

    fn limits(&self, id: PolicyId, min: u32, max: u32) -> Result<()> {
        let handle = self.handle(id)?;
        let (min, max) = {
            let mut data = handle.lock()?;
            data.policy.set_limits(min, max)?;
            data.limiter.mark_limits_changed();
            (data.policy.get_min(), data.policy.get_max())
        };

        handle
            .actuator
            .apply_limits(min, max)
            .with_context(|| format!("Failed to apply limits to policy{id}"))?;
        info!("policy{id} limits: {min}KHz - {max}KHz");
        Ok(())
    }

    fn exit(&self, id: PolicyId) -> Result<()> {
        self.stop(id)?;

        let handle = self
            .policies
            .write()
            .map_err(|_| anyhow!("policy registry poisoned"))?
            .remove(&id)
            .ok_or_else(|| anyhow!("policy{id} is not initialized"))?;

        handle.actuator.shutdown();
        self.release_tunables(id, &handle.tunables, true);
        info!("policy{id} exited");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        actuator::mock::MockDriver,
        frame_boost::boost_duration_ns,
        frequency_table::FrequencyTable,
        sampler::{UtilBreakdown, WaltLoad},
    };

    const MS: u64 = 1_000_000;
    const US: u64 = 1_000;
    const MAX_FREQ: u32 = 2_000_000;

    fn table() -> FrequencyTable {
        FrequencyTable::new(vec![300_000, 1_000_000, 1_500_000, 1_600_000, MAX_FREQ])
    }

    fn fast_policy(id: PolicyId, cpus: Vec<usize>) -> CpufreqPolicy {
        CpufreqPolicy::new(id, cpus, table())
            .unwrap()
            .with_fast_switch(true)
    }

    fn options() -> GovernorOptions {
        GovernorOptions {
            worker_rt_priority: None,
            bind_worker: false,
            ..Default::default()
        }
    }

    fn governor(opts: GovernorOptions) -> (FrameAwareGovernor, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::default());
        (FrameAwareGovernor::new(driver.clone(), opts), driver)
    }

    fn sample(util: u64) -> CpuSample {
        CpuSample {
            util: UtilBreakdown {
                cfs: util,
                ..Default::default()
            },
            max_capacity: 1024,
            ..Default::default()
        }
    }

    fn started(gov: &FrameAwareGovernor, policy: CpufreqPolicy) {
        let id = policy.id();
        gov.init(policy).unwrap();
        gov.start(id).unwrap();
        gov.store_tunable(id, "up_rate_limit_us", "2000").unwrap();
        gov.store_tunable(id, "down_rate_limit_us", "1000").unwrap();
    }

    #[test]
    fn duplicate_init_is_busy() {
        let (gov, _) = governor(options());
        gov.init(fast_policy(0, vec![0])).unwrap();
        let err = gov.init(fast_policy(0, vec![0])).unwrap_err();
        assert!(err.to_string().contains("busy"));
        assert_eq!(gov.policy_ids(), vec![0]);
    }

    #[test]
    fn high_util_commits_max_freq() {
        let (gov, driver) = governor(options());
        started(&gov, fast_policy(0, vec![0]));

        gov.update_util(0, 10 * MS, &sample(820), UpdateFlags::empty());
        let snap = gov.snapshot(0).unwrap();
        assert_eq!(snap.cur, MAX_FREQ);
        assert_eq!(snap.next_freq, MAX_FREQ);
        assert_eq!(*driver.fast_calls.lock().unwrap(), vec![MAX_FREQ]);
    }

    #[test]
    fn up_change_is_rate_limited() {
        let (gov, _) = governor(options());
        started(&gov, fast_policy(0, vec![0]));

        gov.update_util(0, 10 * MS, &sample(400), UpdateFlags::empty());
        assert_eq!(gov.snapshot(0).unwrap().cur, 1_000_000);

        gov.update_util(0, 10 * MS + 1500 * US, &sample(819), UpdateFlags::empty());
        assert_eq!(gov.snapshot(0).unwrap().cur, 1_000_000);

        gov.update_util(0, 10 * MS + 2100 * US, &sample(819), UpdateFlags::empty());
        let snap = gov.snapshot(0).unwrap();
        assert_eq!(snap.cur, MAX_FREQ);
        assert_eq!(snap.last_update, 10 * MS + 2100 * US);
    }

    #[test]
    fn skip_limits_bypasses_rate_limit() {
        let (gov, _) = governor(options());
        started(&gov, fast_policy(0, vec![0]));

        gov.update_util(0, 10 * MS, &sample(400), UpdateFlags::empty());
        gov.update_util(0, 10 * MS + 100 * US, &sample(819), UpdateFlags::SKIP_LIMITS);
        assert_eq!(gov.snapshot(0).unwrap().cur, MAX_FREQ);
    }

    #[test]
    fn continue_flag_only_records() {
        let (gov, driver) = governor(options());
        started(&gov, fast_policy(0, vec![0]));

        gov.update_util(0, 10 * MS, &sample(820), UpdateFlags::CONTINUE);
        assert!(driver.fast_calls.lock().unwrap().is_empty());
        assert_eq!(gov.snapshot(0).unwrap().next_freq, 0);
    }

    #[test]
    fn pl_updates_gated_by_tunable() {
        let (gov, driver) = governor(options());
        started(&gov, fast_policy(0, vec![0]));
        gov.store_tunable(0, "pl", "0").unwrap();

        gov.update_util(0, 10 * MS, &sample(820), UpdateFlags::PL);
        assert!(driver.fast_calls.lock().unwrap().is_empty());

        gov.store_tunable(0, "pl", "1").unwrap();
        gov.update_util(0, 10 * MS, &sample(820), UpdateFlags::PL);
        assert_eq!(gov.snapshot(0).unwrap().cur, MAX_FREQ);
    }

    #[test]
    fn shared_policy_follows_busiest_cpu() {
        let (gov, _) = governor(options());
        started(&gov, fast_policy(0, vec![0, 1, 2, 3]));

        gov.update_util(0, 10 * MS, &sample(100), UpdateFlags::CONTINUE);
        gov.update_util(2, 10 * MS, &sample(820), UpdateFlags::CONTINUE);
        gov.update_util(1, 10 * MS, &sample(50), UpdateFlags::empty());
        assert_eq!(gov.snapshot(0).unwrap().cur, MAX_FREQ);
    }

    #[test]
    fn busy_single_cpu_does_not_drop() {
        let (gov, _) = governor(options());
        started(&gov, fast_policy(0, vec![0]));

        let mut s = sample(820);
        s.idle_calls = Some(7);
        gov.update_util(0, 10 * MS, &s, UpdateFlags::empty());
        assert_eq!(gov.snapshot(0).unwrap().cur, MAX_FREQ);

        // 空闲计数未变化，不允许降频
        let mut s = sample(100);
        s.idle_calls = Some(7);
        gov.update_util(0, 20 * MS, &s, UpdateFlags::empty());
        assert_eq!(gov.snapshot(0).unwrap().cur, MAX_FREQ);

        s.idle_calls = Some(8);
        gov.update_util(0, 30 * MS, &s, UpdateFlags::empty());
        assert!(gov.snapshot(0).unwrap().cur < MAX_FREQ);
    }

    #[test]
    fn jank_frame_boosts_and_expires() {
        let (gov, _) = governor(options());
        started(&gov, fast_policy(0, vec![0]));
        gov.store_tunable(0, "frame_freq", "1000000").unwrap();

        gov.update_util(0, 10 * MS, &sample(400), UpdateFlags::empty());
        assert_eq!(gov.snapshot(0).unwrap().cur, 1_000_000);

        // 帧感知未开启时丢弃
        gov.on_jank_frame(0, 8000, 20 * MS);
        assert_eq!(gov.snapshot(0).unwrap().pending_boosts, 0);

        gov.store_tunable(0, "frame_aware", "1").unwrap();
        gov.on_jank_frame(0, 8000, 20 * MS);
        let snap = gov.snapshot(0).unwrap();
        assert_eq!(snap.pending_boosts, 1);
        assert_eq!(snap.cur, MAX_FREQ);

        // 加速期间低利用率不会降频
        gov.update_util(0, 50 * MS, &sample(400), UpdateFlags::empty());
        assert_eq!(gov.snapshot(0).unwrap().cur, MAX_FREQ);

        let after = 20 * MS + boost_duration_ns() + 10 * MS;
        gov.update_util(0, after, &sample(400), UpdateFlags::empty());
        let snap = gov.snapshot(0).unwrap();
        assert_eq!(snap.pending_boosts, 0);
        assert_eq!(snap.cur, 1_000_000);
    }

    #[test]
    fn jank_boost_is_never_rounded_down() {
        let (gov, _) = governor(options());
        started(&gov, fast_policy(0, vec![0]));
        gov.store_tunable(0, "frame_freq", "1000000").unwrap();
        gov.update_util(0, 10 * MS, &sample(400), UpdateFlags::empty());
        assert_eq!(gov.snapshot(0).unwrap().cur, 1_000_000);

        // 1_000_000 * 6040 / 4000 = 1_510_000，取上一档
        gov.store_tunable(0, "frame_aware", "1").unwrap();
        gov.on_jank_frame(0, 6040, 20 * MS);
        assert_eq!(gov.snapshot(0).unwrap().cur, 1_600_000);
    }

    #[test]
    fn shared_walt_idle_policy_stays_below_max() {
        let (gov, _) = governor(GovernorOptions {
            load_tracking: LoadTracking::Walt,
            ..options()
        });
        started(&gov, fast_policy(0, vec![0, 1]));
        gov.store_tunable(0, "rtg_boost_freq", "1000000").unwrap();

        let mut s = sample(0);
        s.walt = WaltLoad {
            ws: 20 * MS,
            rtgb_active: true,
            ..Default::default()
        };
        gov.update_util(0, 10 * MS, &s, UpdateFlags::empty());

        // rtg 下限 394/1024 对应 1_000_000，而不是按 max=1 拉满
        let snap = gov.snapshot(0).unwrap();
        assert_eq!(snap.next_freq, 1_000_000);
        assert_eq!(snap.cur, 1_000_000);
    }

    #[test]
    fn dl_bandwidth_rise_forces_one_recompute() {
        let (gov, _) = governor(options());
        started(&gov, fast_policy(0, vec![0]));
        let cached = || gov.handle(0).unwrap().lock().unwrap().limiter.cached_raw_freq();

        gov.update_util(0, 10 * MS, &sample(400), UpdateFlags::empty());
        assert_eq!(cached(), 976_562);

        // 限速窗口内 DL 带宽上升，仍然重新计算
        let mut s = sample(400);
        s.util.dl_bw = 8;
        gov.update_util(0, 10 * MS + 200 * US, &s, UpdateFlags::empty());
        assert_eq!(cached(), 1_000_976);
        assert_eq!(gov.snapshot(0).unwrap().cur, 1_000_000);

        // 带宽不再上升，窗口内的更新再次被拦截
        s.util.cfs = 600;
        gov.update_util(0, 10 * MS + 400 * US, &s, UpdateFlags::empty());
        assert_eq!(cached(), 1_000_976);
        assert_eq!(gov.snapshot(0).unwrap().cur, 1_000_000);
    }

    #[test]
    fn jank_on_ungoverned_cpu_is_dropped() {
        let (gov, driver) = governor(options());
        started(&gov, fast_policy(0, vec![0]));
        gov.store_tunable(0, "frame_aware", "1").unwrap();
        gov.on_jank_frame(5, 8000, 20 * MS);
        assert!(driver.fast_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_unhooks_and_purges() {
        let (gov, driver) = governor(options());
        started(&gov, fast_policy(0, vec![0]));
        gov.store_tunable(0, "frame_aware", "1").unwrap();
        gov.on_jank_frame(0, 8000, 20 * MS);
        let calls = driver.fast_calls.lock().unwrap().len();

        gov.stop(0).unwrap();
        gov.stop(0).unwrap();
        assert_eq!(gov.snapshot(0).unwrap().pending_boosts, 0);

        gov.update_util(0, 40 * MS, &sample(100), UpdateFlags::SKIP_LIMITS);
        assert_eq!(driver.fast_calls.lock().unwrap().len(), calls);
    }

    #[test]
    fn limits_clamp_and_force_update() {
        let (gov, driver) = governor(options());
        started(&gov, fast_policy(0, vec![0]));
        gov.update_util(0, 10 * MS, &sample(820), UpdateFlags::empty());

        gov.limits(0, 300_000, 1_500_000).unwrap();
        assert_eq!(gov.snapshot(0).unwrap().cur, 1_500_000);
        assert_eq!(*driver.limits.lock().unwrap(), vec![(300_000, 1_500_000)]);

        // 原始频率未变，但限制变化后必须重新解析
        gov.update_util(0, 12 * MS, &sample(820), UpdateFlags::empty());
        assert_eq!(gov.snapshot(0).unwrap().next_freq, 1_500_000);

        assert!(gov.limits(0, 1_600_000, 1_000_000).is_err());
    }

    #[test]
    fn tunables_survive_exit_and_init() {
        let (gov, _) = governor(options());
        gov.init(fast_policy(0, vec![0])).unwrap();
        gov.store_tunable(0, "up_rate_limit_us", "5000").unwrap();
        assert!(gov.store_tunable(0, "up_rate_limit_us", "fast").is_err());
        assert_eq!(gov.show_tunable(0, "up_rate_limit_us").unwrap(), "5000");

        gov.exit(0).unwrap();
        assert!(gov.snapshot(0).is_none());

        gov.init(fast_policy(0, vec![0])).unwrap();
        assert_eq!(gov.show_tunable(0, "up_rate_limit_us").unwrap(), "5000");
    }

    #[test]
    fn global_tunables_are_shared() {
        let (gov, _) = governor(GovernorOptions {
            per_policy_tunables: false,
            ..options()
        });
        gov.init(fast_policy(0, vec![0, 1])).unwrap();
        gov.init(fast_policy(1, vec![2, 3])).unwrap();

        gov.store_tunable(0, "frame_aware", "y").unwrap();
        assert_eq!(gov.show_tunable(1, "frame_aware").unwrap(), "1");

        gov.exit(0).unwrap();
        assert_eq!(gov.show_tunable(1, "frame_aware").unwrap(), "1");
    }

    #[test]
    fn deferred_commit_updates_current_freq() {
        let (gov, driver) = governor(options());
        let policy = CpufreqPolicy::new(0, vec![0, 1], table()).unwrap();
        started(&gov, policy);

        gov.update_util(0, 10 * MS, &sample(820), UpdateFlags::empty());
        gov.stop(0).unwrap();
        assert_eq!(gov.snapshot(0).unwrap().cur, MAX_FREQ);
        assert_eq!(*driver.target_calls.lock().unwrap(), vec![MAX_FREQ]);
        gov.exit(0).unwrap();
    }

    #[test]
    fn worker_failure_leaves_no_policy() {
        let (gov, _) = governor(GovernorOptions {
            bind_worker: true,
            ..options()
        });
        let cpu = libc::CPU_SETSIZE as usize - 1;
        let policy = CpufreqPolicy::new(3, vec![cpu], table()).unwrap();
        assert!(gov.init(policy).is_err());
        assert!(gov.policy_ids().is_empty());
    }
}
