// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The worker pool.
//!
//! All worker state lives in one map behind the pool lock. Remote calls
//! (cloud API, SSH) are never made while holding it: state is captured, the
//! lock released, the call made, and the result applied under the lock
//! again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dispatch_cloud_driver::{
    CloudError, ExecutorTarget, ImageId, Instance, InstanceId, InstanceSet, InstanceSetId,
    InstanceTags, InstanceType,
};
use opentelemetry::metrics::Gauge;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::limiter::RateLimiter;
use super::probe::{Worker, probe_and_update};
use super::runner::{RemoteRunner, RunnerHooks, RunnerSettings};
use super::throttle::Throttle;
use super::verify::{TagVerifier, generate_secret, init_command};
use super::{IdleBehavior, InstanceView, State, tag_keys};
use crate::config::Timeouts;
use crate::container::Container;
use crate::executor::{Executor, ExecutorFactory};
use crate::notify::{Notifier, Subscription};

/// How long `create` fails fast after a quota error.
pub const QUOTA_ERROR_TTL: Duration = Duration::from_secs(60);

/// Worker pool errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No worker has this instance ID.
    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),

    /// A recent quota error makes `create` pointless.
    #[error("at quota")]
    AtQuota,

    /// `create` is paused after a rate-limit error.
    #[error("create throttled: {0}")]
    Throttled(CloudError),

    /// The pool has been stopped.
    #[error("worker pool is stopped")]
    Stopped,
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Image for new instances.
    pub image_id: ImageId,
    /// Public key installed on new instances.
    pub public_key: Option<String>,
    /// Prefix for reserved tag keys.
    /// Default: "dispatch-"
    pub tag_key_prefix: String,
    /// Remote supervisor command.
    /// Default: "dispatch-supervisor"
    pub supervisor_command: String,
    /// Environment passed to every supervisor.
    pub supervisor_env: BTreeMap<String, String>,
    /// Boot probe command.
    /// Default: "true"
    pub boot_probe_command: String,
    /// When non-empty, `--list` lines not starting with it are ignored.
    pub cluster_id: String,
    /// Interval between instance list syncs.
    /// Default: 60s
    pub sync_interval: Duration,
    /// Interval between probe rounds.
    /// Default: 10s
    pub probe_interval: Duration,
    /// Maximum probes started per second.
    /// Default: 10
    pub max_probes_per_second: u32,
    /// Worker timeouts.
    pub timeouts: Timeouts,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            image_id: ImageId::default(),
            public_key: None,
            tag_key_prefix: "dispatch-".to_string(),
            supervisor_command: "dispatch-supervisor".to_string(),
            supervisor_env: BTreeMap::new(),
            boot_probe_command: "true".to_string(),
            cluster_id: String::new(),
            sync_interval: Duration::from_secs(60),
            probe_interval: Duration::from_secs(10),
            max_probes_per_second: 10,
            timeouts: Timeouts::default(),
        }
    }
}

impl PoolConfig {
    pub(crate) fn tag(&self, key: &str) -> String {
        format!("{}{}", self.tag_key_prefix, key)
    }
}

/// A pending `create` call.
pub(crate) struct Creating {
    pub(crate) at: Instant,
    pub(crate) instance_type: String,
}

#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) workers: HashMap<InstanceId, Worker>,
    /// Pending creates keyed by instance secret.
    pub(crate) creating: HashMap<String, Creating>,
    /// Supervisors seen exiting, until the scheduler has dealt with them.
    pub(crate) exited: HashMap<String, Instant>,
    pub(crate) at_quota_until: Option<Instant>,
    pub(crate) loaded: bool,
    pub(crate) stopped: bool,
}

struct PoolMetrics {
    instances_total: Gauge<u64>,
    containers_running: Gauge<u64>,
    vcpus_total: Gauge<u64>,
    vcpus_inuse: Gauge<u64>,
    memory_bytes_total: Gauge<u64>,
    memory_bytes_inuse: Gauge<u64>,
}

impl PoolMetrics {
    fn new() -> Self {
        let meter = opentelemetry::global::meter("dispatch_cloud");
        let gauge = |name: &'static str, description: &'static str| {
            meter.u64_gauge(name).with_description(description).build()
        };
        Self {
            instances_total: gauge("instances_total", "Number of cloud VMs"),
            containers_running: gauge(
                "containers_running",
                "Number of containers reported running by cloud VMs",
            ),
            vcpus_total: gauge("vcpus_total", "Total VCPUs on all cloud VMs"),
            vcpus_inuse: gauge("vcpus_inuse", "VCPUs on cloud VMs that are running containers"),
            memory_bytes_total: gauge("memory_bytes_total", "Total memory on all cloud VMs"),
            memory_bytes_inuse: gauge(
                "memory_bytes_inuse",
                "Memory on cloud VMs that are running containers",
            ),
        }
    }

    fn record(&self, state: &PoolState) {
        let (mut running, mut cpu, mut cpu_inuse, mut mem, mut mem_inuse) = (0u64, 0, 0, 0, 0);
        for w in state.workers.values() {
            let vcpus = w.instance_type.vcpus.max(0) as u64;
            let ram = w.instance_type.ram.max(0) as u64;
            cpu += vcpus;
            mem += ram;
            let busy = (w.running.len() + w.starting.len()) as u64;
            if busy == 0 {
                continue;
            }
            running += busy;
            cpu_inuse += vcpus;
            mem_inuse += ram;
        }
        self.instances_total.record(state.workers.len() as u64, &[]);
        self.containers_running.record(running, &[]);
        self.vcpus_total.record(cpu, &[]);
        self.vcpus_inuse.record(cpu_inuse, &[]);
        self.memory_bytes_total.record(mem, &[]);
        self.memory_bytes_inuse.record(mem_inuse, &[]);
    }
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    instance_set: Arc<dyn InstanceSet>,
    instance_set_id: InstanceSetId,
    instance_types: BTreeMap<String, InstanceType>,
    new_executor: ExecutorFactory,
    pub(crate) state: Mutex<PoolState>,
    notifier: Notifier,
    create_throttle: Throttle,
    instances_throttle: Throttle,
    metrics: PoolMetrics,
    stop: watch::Sender<bool>,
}

/// Owns the workers for one instance set.
#[derive(Clone)]
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool. Call [`Pool::run`] to start syncing and probing.
    pub fn new(
        config: PoolConfig,
        instance_set: Arc<dyn InstanceSet>,
        instance_set_id: InstanceSetId,
        instance_types: BTreeMap<String, InstanceType>,
        new_executor: ExecutorFactory,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                config,
                instance_set,
                instance_set_id,
                instance_types,
                new_executor,
                state: Mutex::new(PoolState::default()),
                notifier: Notifier::new(),
                create_throttle: Throttle::new(),
                instances_throttle: Throttle::new(),
                metrics: PoolMetrics::new(),
                stop,
            }),
        }
    }

    /// Notifications for any change in worker state.
    pub fn subscribe(&self) -> Subscription {
        self.inner.notifier.subscribe()
    }

    pub(crate) fn notify(&self) {
        self.inner.notifier.notify();
    }

    fn notify_callback(&self) -> Arc<dyn Fn() + Send + Sync> {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.notifier.notify();
            }
        })
    }

    // ========================================================================
    // Scheduler interface
    // ========================================================================

    /// Count of workers that will be available for new containers soon,
    /// per instance type name: idle, booting, unknown, and pending creates.
    ///
    /// An `Unknown` worker that appeared after the oldest pending create of
    /// its type is taken to be the result of that create, so it is not
    /// counted twice.
    pub async fn unallocated(&self) -> BTreeMap<String, usize> {
        let state = self.inner.state.lock().await;
        let mut creating: BTreeMap<String, usize> = BTreeMap::new();
        let mut oldest_create: BTreeMap<String, Instant> = BTreeMap::new();
        for c in state.creating.values() {
            *creating.entry(c.instance_type.clone()).or_default() += 1;
            oldest_create
                .entry(c.instance_type.clone())
                .and_modify(|t| *t = (*t).min(c.at))
                .or_insert(c.at);
        }
        let mut unalloc: BTreeMap<String, usize> = BTreeMap::new();
        for w in state.workers.values() {
            if matches!(w.state, State::Shutdown | State::Running)
                || w.idle_behavior != IdleBehavior::Run
                || !w.running.is_empty()
            {
                continue;
            }
            let name = &w.instance_type.name;
            *unalloc.entry(name.clone()).or_default() += 1;
            if w.state == State::Unknown {
                if let (Some(n), Some(oldest)) = (creating.get_mut(name), oldest_create.get(name)) {
                    if *n > 0 && w.appeared > *oldest {
                        *n -= 1;
                    }
                }
            }
        }
        for (name, n) in creating {
            *unalloc.entry(name).or_default() += n;
        }
        unalloc
    }

    /// Whether `create` is expected to fail because of a recent quota error.
    pub async fn at_quota(&self) -> bool {
        let state = self.inner.state.lock().await;
        state
            .at_quota_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Start creating an instance of type `it` in the background.
    ///
    /// Fails fast while at quota or throttled.
    pub async fn create(&self, it: &InstanceType) -> Result<(), PoolError> {
        if let Some(err) = self.inner.create_throttle.error().await {
            return Err(PoolError::Throttled(err));
        }
        let secret = generate_secret();
        {
            let mut state = self.inner.state.lock().await;
            if state.stopped {
                return Err(PoolError::Stopped);
            }
            if state
                .at_quota_until
                .is_some_and(|until| Instant::now() < until)
            {
                return Err(PoolError::AtQuota);
            }
            state.creating.insert(
                secret.clone(),
                Creating {
                    at: Instant::now(),
                    instance_type: it.name.clone(),
                },
            );
        }
        let pool = self.clone();
        let it = it.clone();
        tokio::spawn(async move { pool.run_create(it, secret).await });
        Ok(())
    }

    async fn run_create(&self, it: InstanceType, secret: String) {
        let config = &self.inner.config;
        let tags = InstanceTags::from([
            (
                config.tag(tag_keys::INSTANCE_SET_ID),
                self.inner.instance_set_id.to_string(),
            ),
            (config.tag(tag_keys::INSTANCE_TYPE), it.name.clone()),
            (
                config.tag(tag_keys::IDLE_BEHAVIOR),
                IdleBehavior::Run.as_str().to_string(),
            ),
            (config.tag(tag_keys::INSTANCE_SECRET), secret.clone()),
        ]);
        let result = self
            .inner
            .instance_set
            .create(
                &it,
                &config.image_id,
                tags,
                init_command(&secret),
                config.public_key.as_deref(),
            )
            .await;

        if let Err(err) = &result {
            self.inner
                .create_throttle
                .check_rate_limit_error(err, "create instance", self.notify_callback())
                .await;
        }

        let mut state = self.inner.state.lock().await;
        let mut retarget = None;
        match result {
            Ok(inst) => {
                retarget = self.update_worker(&mut state, inst, &it).await;
            }
            Err(err) => {
                if err.is_quota_error() {
                    state.at_quota_until = Some(Instant::now() + QUOTA_ERROR_TTL);
                    let notify = self.notify_callback();
                    tokio::spawn(async move {
                        tokio::time::sleep(QUOTA_ERROR_TTL).await;
                        notify();
                    });
                }
                error!(instance_type = %it.name, error = %err, "create failed");
            }
        }
        // Removed after update_worker so the new worker starts as Booting.
        state.creating.remove(&secret);
        drop(state);
        self.notify();
        if let Some((executor, target)) = retarget {
            executor.set_target(target).await;
        }
    }

    /// Add or refresh the worker for `inst`. Caller holds the pool lock.
    ///
    /// Returns an executor retarget to apply after the lock is released.
    async fn update_worker(
        &self,
        state: &mut PoolState,
        inst: Arc<dyn Instance>,
        it: &InstanceType,
    ) -> Option<(Arc<dyn Executor>, Arc<dyn ExecutorTarget>)> {
        let config = &self.inner.config;
        let tags = inst.tags();
        let secret = tags
            .get(&config.tag(tag_keys::INSTANCE_SECRET))
            .cloned()
            .unwrap_or_default();
        let target: Arc<dyn ExecutorTarget> =
            Arc::new(TagVerifier::new(inst.clone(), secret.clone()));
        let id = inst.id();
        let now = Instant::now();

        if let Some(w) = state.workers.get_mut(&id) {
            w.instance = inst;
            w.updated = now;
            w.save_tags(config);
            return Some((w.executor.clone(), target));
        }

        let initial = if state.creating.contains_key(&secret) {
            State::Booting
        } else {
            State::Unknown
        };
        let idle_behavior = tags
            .get(&config.tag(tag_keys::IDLE_BEHAVIOR))
            .and_then(|v| IdleBehavior::parse(v))
            .unwrap_or_else(|| {
                let hold = tags
                    .get(&config.tag(tag_keys::HOLD))
                    .is_some_and(|v| !v.is_empty());
                if hold {
                    IdleBehavior::Hold
                } else {
                    IdleBehavior::Run
                }
            });
        info!(
            instance_id = %id,
            instance_type = %it.name,
            state = %initial,
            idle_behavior = %idle_behavior,
            "instance appeared in cloud"
        );
        let executor = (self.inner.new_executor)(&inst);
        // A fresh executor has no connection to contend with.
        executor.set_target(target).await;
        let w = Worker::new(inst, it.clone(), executor, initial, idle_behavior, now);
        w.save_tags(config);
        state.workers.insert(id, w);
        None
    }

    /// Start the supervisor for `ctr` on an idle worker of type `it`.
    ///
    /// Picks the worker that has been idle longest. Returns `false` when no
    /// worker is available.
    pub async fn start_container(&self, it: &InstanceType, ctr: &Container) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(id) = state
            .workers
            .iter()
            .filter(|(_, w)| {
                w.instance_type.name == it.name
                    && w.state == State::Idle
                    && w.idle_behavior == IdleBehavior::Run
            })
            .min_by_key(|(_, w)| w.busy)
            .map(|(id, _)| id.clone())
        else {
            return false;
        };
        let Some(w) = state.workers.get_mut(&id) else {
            return false;
        };
        let rr = self.new_runner(w, &ctr.uuid);
        debug!(instance_id = %id, container_uuid = %ctr.uuid, priority = ctr.priority, "starting container");
        w.starting.insert(ctr.uuid.clone(), rr.clone());
        w.state = State::Running;
        w.last_uuid = ctr.uuid.clone();
        drop(state);
        self.notify();

        let pool = self.clone();
        let uuid = ctr.uuid.clone();
        tokio::spawn(async move {
            let ok = rr.start().await.is_ok();
            pool.start_finished(&id, &uuid, ok).await;
        });
        true
    }

    async fn start_finished(&self, id: &InstanceId, uuid: &str, ok: bool) {
        let mut state = self.inner.state.lock().await;
        let PoolState {
            workers, exited, ..
        } = &mut *state;
        let Some(w) = workers.get_mut(id) else {
            return;
        };
        if !w.starting.contains_key(uuid) {
            return;
        }
        if ok {
            let now = Instant::now();
            w.updated = now;
            w.busy = now;
            w.launched.insert(uuid.to_string());
        } else {
            w.close_runner(uuid, exited);
        }
        drop(state);
        self.notify();
    }

    pub(crate) fn new_runner(&self, w: &Worker, uuid: &str) -> Arc<RemoteRunner> {
        let config = &self.inner.config;
        let settings = RunnerSettings {
            command: sudo(&w.instance.remote_user(), &config.supervisor_command),
            env: config.supervisor_env.clone(),
            timeout_signal: config.timeouts.signal,
            timeout_term: config.timeouts.term,
        };
        let hooks = Arc::new(WorkerHooks {
            pool: Arc::downgrade(&self.inner),
            instance_id: w.instance.id(),
        });
        Arc::new(RemoteRunner::new(
            uuid,
            w.executor.clone(),
            settings,
            hooks,
        ))
    }

    /// Kill the supervisor for `uuid`, wherever it runs.
    ///
    /// If the supervisor is already known to have exited, only the exited
    /// placeholder is cleared. Returns whether anything was found.
    pub async fn kill_container(&self, uuid: &str, reason: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.exited.remove(uuid).is_some() {
            debug!(container_uuid = %uuid, "clearing placeholder for exited supervisor process");
            return true;
        }
        for w in state.workers.values() {
            if let Some(rr) = w.running.get(uuid).or_else(|| w.starting.get(uuid)) {
                rr.kill(reason);
                return true;
            }
        }
        debug!(container_uuid = %uuid, "cannot kill: already disappeared");
        false
    }

    /// Drop the exited placeholder for `uuid`.
    pub async fn forget_container(&self, uuid: &str) {
        self.inner.state.lock().await.exited.remove(uuid);
    }

    /// Every container with a supervisor on some worker, plus exited ones.
    ///
    /// The value is the time the supervisor was seen exiting, or `None`
    /// while it is starting or running.
    pub async fn running(&self) -> HashMap<String, Option<Instant>> {
        let state = self.inner.state.lock().await;
        let mut r = HashMap::new();
        for w in state.workers.values() {
            for uuid in w.running.keys().chain(w.starting.keys()) {
                r.insert(uuid.clone(), None);
            }
        }
        for (uuid, at) in &state.exited {
            r.insert(uuid.clone(), Some(*at));
        }
        r
    }

    /// Number of workers in each state.
    pub async fn count_workers(&self) -> BTreeMap<State, usize> {
        let state = self.inner.state.lock().await;
        let mut r = BTreeMap::new();
        for w in state.workers.values() {
            *r.entry(w.state).or_default() += 1;
        }
        r
    }

    /// Shut down one booting or idle worker of the named instance type.
    ///
    /// Returns `false` when every worker of that type is busy or held.
    pub async fn shutdown(&self, instance_type: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        info!(instance_type, "shutdown requested");
        for try_state in [State::Booting, State::Idle] {
            let found = state.workers.values_mut().find(|w| {
                w.idle_behavior != IdleBehavior::Hold
                    && w.state == try_state
                    && w.instance_type.name == instance_type
            });
            if let Some(w) = found {
                info!(instance_id = %w.instance.id(), "shutting down");
                w.shutdown(self);
                return true;
            }
        }
        false
    }

    /// Set a worker's idle behavior and persist it as a tag.
    pub async fn set_idle_behavior(
        &self,
        id: &InstanceId,
        behavior: IdleBehavior,
    ) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock().await;
        let w = state
            .workers
            .get_mut(id)
            .ok_or_else(|| PoolError::InstanceNotFound(id.clone()))?;
        info!(instance_id = %id, idle_behavior = %behavior, "setting idle behavior");
        w.set_idle_behavior(self, behavior);
        drop(state);
        self.notify();
        Ok(())
    }

    /// Shut down a worker now, whatever it is doing.
    pub async fn kill_instance(&self, id: &InstanceId, reason: &str) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock().await;
        let w = state
            .workers
            .get_mut(id)
            .ok_or_else(|| PoolError::InstanceNotFound(id.clone()))?;
        info!(instance_id = %id, reason, "shutting down");
        w.shutdown(self);
        Ok(())
    }

    /// A view of every worker, sorted by instance ID.
    pub async fn instances(&self) -> Vec<InstanceView> {
        let state = self.inner.state.lock().await;
        let now = Instant::now();
        let wall = Utc::now();
        let mut r: Vec<InstanceView> = state
            .workers
            .values()
            .map(|w| {
                let since_busy = chrono::Duration::from_std(now.saturating_duration_since(w.busy))
                    .unwrap_or_else(|_| chrono::Duration::zero());
                InstanceView {
                    instance: w.instance.id().to_string(),
                    address: w.instance.address().unwrap_or_default(),
                    worker_state: w.state,
                    idle_behavior: w.idle_behavior,
                    arvados_instance_type: w.instance_type.name.clone(),
                    provider_instance_type: w.instance_type.provider_type.clone(),
                    price: w.instance_type.price,
                    last_container_uuid: w.last_uuid.clone(),
                    last_busy: wall - since_busy,
                }
            })
            .collect();
        r.sort_by(|a, b| a.instance.cmp(&b.instance));
        r
    }

    /// Whether the first instance list has been loaded.
    pub async fn is_loaded(&self) -> bool {
        self.inner.state.lock().await.loaded
    }

    // ========================================================================
    // Sync and probe loops
    // ========================================================================

    /// Fetch the instance list and reconcile workers with it.
    pub async fn sync_once(&self) -> Result<(), CloudError> {
        if let Some(err) = self.inner.instances_throttle.error().await {
            return Err(err);
        }
        debug!("getting instance list");
        let threshold = Instant::now();
        let filter = InstanceTags::from([(
            self.inner.config.tag(tag_keys::INSTANCE_SET_ID),
            self.inner.instance_set_id.to_string(),
        )]);
        match self.inner.instance_set.instances(&filter).await {
            Ok(instances) => {
                self.sync(threshold, instances).await;
                Ok(())
            }
            Err(err) => {
                self.inner
                    .instances_throttle
                    .check_rate_limit_error(&err, "list instances", self.notify_callback())
                    .await;
                Err(err)
            }
        }
    }

    /// Add, refresh and remove workers to match `instances`, without
    /// clobbering anything updated after `threshold`.
    async fn sync(&self, threshold: Instant, instances: Vec<Arc<dyn Instance>>) {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock().await;
        debug!(instances = instances.len(), "sync instances");
        let mut notify = false;
        let mut retargets = Vec::new();

        for inst in instances {
            let type_tag = inst
                .tags()
                .get(&config.tag(tag_keys::INSTANCE_TYPE))
                .cloned()
                .unwrap_or_default();
            let Some(it) = self.inner.instance_types.get(&type_tag).cloned() else {
                error!(instance_id = %inst.id(), instance_type = %type_tag, "unknown instance type tag; ignoring");
                continue;
            };
            let id = inst.id();
            let is_new = !state.workers.contains_key(&id);
            if let Some(retarget) = self.update_worker(&mut state, inst, &it).await {
                retargets.push(retarget);
            }
            if is_new {
                notify = true;
                continue;
            }
            if let Some(w) = state.workers.get_mut(&id) {
                let overdue = w.state == State::Shutdown
                    && w
                        .destroyed
                        .is_some_and(|t| t.elapsed() > config.timeouts.shutdown);
                if overdue {
                    info!(instance_id = %id, "worker still listed after shutdown; retrying");
                    w.shutdown(self);
                }
            }
        }

        let gone: Vec<InstanceId> = state
            .workers
            .iter()
            .filter(|(_, w)| w.updated < threshold)
            .map(|(id, _)| id.clone())
            .collect();
        for id in gone {
            if let Some(w) = state.workers.remove(&id) {
                info!(instance_id = %id, state = %w.state, "instance disappeared in cloud");
                w.close();
                notify = true;
            }
        }

        if !state.loaded {
            state.loaded = true;
            notify = true;
            info!(workers = state.workers.len(), "loaded initial instance list");
        }
        drop(state);
        for (executor, target) in retargets {
            executor.set_target(target).await;
        }
        if notify {
            self.notify();
        }
    }

    /// Run the sync, probe and metrics loops until [`Pool::stop`].
    pub async fn run(&self) {
        info!(
            sync_interval_secs = self.inner.config.sync_interval.as_secs(),
            probe_interval_secs = self.inner.config.probe_interval.as_secs(),
            "worker pool started"
        );
        tokio::join!(self.run_sync(), self.run_probes(), self.run_metrics());
        debug!("worker pool stopped");
    }

    async fn run_sync(&self) {
        let mut stop = self.inner.stop.subscribe();
        loop {
            if *stop.borrow() {
                return;
            }
            if let Err(err) = self.sync_once().await {
                warn!(error = %err, "sync failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.sync_interval) => {}
                _ = stop.wait_for(|s| *s) => return,
            }
        }
    }

    async fn run_probes(&self) {
        let mut stop = self.inner.stop.subscribe();
        let limiter = RateLimiter::per_second(self.inner.config.max_probes_per_second.max(1));
        let mut ticker = tokio::time::interval(self.inner.config.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.wait_for(|s| *s) => return,
            }
            let ids: Vec<InstanceId> = {
                let mut state = self.inner.state.lock().await;
                let mut ids = Vec::new();
                for (id, w) in state.workers.iter_mut() {
                    if w.state == State::Shutdown || w.shutdown_if_idle(self) {
                        continue;
                    }
                    ids.push(id.clone());
                }
                ids
            };
            for id in ids {
                let permit = {
                    let state = self.inner.state.lock().await;
                    match state.workers.get(&id) {
                        Some(w) if w.state != State::Shutdown => {
                            w.probing.clone().try_acquire_owned()
                        }
                        _ => continue,
                    }
                };
                match permit {
                    Ok(permit) => {
                        let pool = self.clone();
                        tokio::spawn(async move {
                            probe_and_update(&pool, &id).await;
                            drop(permit);
                        });
                    }
                    Err(_) => debug!(instance_id = %id, "still waiting for last probe to finish"),
                }
                tokio::select! {
                    _ = limiter.wait() => {}
                    _ = stop.wait_for(|s| *s) => return,
                }
            }
        }
    }

    async fn run_metrics(&self) {
        let mut stop = self.inner.stop.subscribe();
        let mut changes = self.subscribe();
        loop {
            {
                let state = self.inner.state.lock().await;
                self.inner.metrics.record(&state);
            }
            tokio::select! {
                alive = changes.changed() => if !alive { return },
                _ = stop.wait_for(|s| *s) => return,
            }
        }
    }

    /// Stop the loops and abandon every worker's runners and connections.
    ///
    /// Instances are left running so the next dispatcher can adopt them.
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        let mut state = self.inner.state.lock().await;
        state.stopped = true;
        for w in state.workers.values() {
            w.close();
        }
    }
}

/// Prefix `command` with `sudo` unless the remote user is root.
pub(crate) fn sudo(remote_user: &str, command: &str) -> String {
    if remote_user == "root" {
        command.to_string()
    } else {
        format!("sudo {}", command)
    }
}

struct WorkerHooks {
    pool: Weak<PoolInner>,
    instance_id: InstanceId,
}

#[async_trait]
impl RunnerHooks for WorkerHooks {
    async fn on_killed(&self, uuid: &str) {
        let Some(inner) = self.pool.upgrade() else {
            return;
        };
        let pool = Pool { inner };
        let mut state = pool.inner.state.lock().await;
        let PoolState {
            workers, exited, ..
        } = &mut *state;
        if let Some(w) = workers.get_mut(&self.instance_id) {
            w.close_runner(uuid, exited);
        }
        drop(state);
        pool.notify();
    }

    async fn on_unkillable(&self, uuid: &str) {
        let Some(inner) = self.pool.upgrade() else {
            return;
        };
        let pool = Pool { inner };
        let mut state = pool.inner.state.lock().await;
        let Some(w) = state.workers.get_mut(&self.instance_id) else {
            return;
        };
        if w.idle_behavior == IdleBehavior::Hold {
            warn!(instance_id = %self.instance_id, container_uuid = %uuid, "unkillable container, but worker is held");
            return;
        }
        warn!(instance_id = %self.instance_id, container_uuid = %uuid, "unkillable container, draining worker");
        w.set_idle_behavior(&pool, IdleBehavior::Drain);
        drop(state);
        pool.notify();
    }
}
