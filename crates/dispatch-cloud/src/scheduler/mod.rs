// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler
//!
//! Maps queued containers onto workers. Each pass runs two steps:
//!
//! - **run queue**: in priority order, lock containers, start locked ones on
//!   idle workers, create instances when nothing fits, and stop at the first
//!   container that cannot be served because the cloud is at quota.
//! - **sync**: reconcile queue states with what the pool reports as running
//!   (cancel orphans, kill supervisors of finished containers, requeue
//!   containers whose supervisor exited before starting them).
//!
//! Passes run whenever the queue or pool reports a change, or every
//! `poll_interval`.
//!
//! Before the first pass, locks left behind by a previous dispatcher process
//! are released once the pool has probed every worker.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dispatch_cloud_driver::InstanceType;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::container::{ApiError, Container, ContainerState, Queue, QueueEnt};
use crate::notify::Subscription;
use crate::worker::{Pool, PoolError, State};

mod run_queue;
mod sync;

/// Delay before retrying an operation that was refused because another
/// operation on the same container was in progress.
const OP_RETRY_DELAY: Duration = Duration::from_millis(250);

// ============================================================================
// Seams
// ============================================================================

/// Queue operations the scheduler depends on.
#[async_trait]
pub trait ContainerQueue: Send + Sync {
    /// Snapshot of all entries and the time of the last successful update.
    async fn entries(&self) -> (HashMap<String, QueueEnt>, Option<Instant>);
    /// Cached record for `uuid`.
    async fn get(&self, uuid: &str) -> Option<Container>;
    /// Drop a finished container from the cache.
    async fn forget(&self, uuid: &str);
    /// Queued -> Locked.
    async fn lock(&self, uuid: &str) -> Result<(), ApiError>;
    /// Locked -> Queued.
    async fn unlock(&self, uuid: &str) -> Result<(), ApiError>;
    /// Cancel a container.
    async fn cancel(&self, uuid: &str) -> Result<(), ApiError>;
    /// Refresh from the control plane.
    async fn update(&self) -> Result<(), ApiError>;
    /// Change notifications.
    fn subscribe(&self) -> Subscription;
}

#[async_trait]
impl ContainerQueue for Queue {
    async fn entries(&self) -> (HashMap<String, QueueEnt>, Option<Instant>) {
        Queue::entries(self).await
    }

    async fn get(&self, uuid: &str) -> Option<Container> {
        Queue::get(self, uuid).await
    }

    async fn forget(&self, uuid: &str) {
        Queue::forget(self, uuid).await
    }

    async fn lock(&self, uuid: &str) -> Result<(), ApiError> {
        Queue::lock(self, uuid).await
    }

    async fn unlock(&self, uuid: &str) -> Result<(), ApiError> {
        Queue::unlock(self, uuid).await
    }

    async fn cancel(&self, uuid: &str) -> Result<(), ApiError> {
        Queue::cancel(self, uuid).await
    }

    async fn update(&self) -> Result<(), ApiError> {
        Queue::update(self).await
    }

    fn subscribe(&self) -> Subscription {
        Queue::subscribe(self)
    }
}

/// Worker pool operations the scheduler depends on.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Idle or booting workers with no container assigned, by type name.
    async fn unallocated(&self) -> BTreeMap<String, usize>;
    /// Whether the last create hit a quota limit recently.
    async fn at_quota(&self) -> bool;
    /// Start creating an instance of type `it`.
    async fn create(&self, it: &InstanceType) -> Result<(), PoolError>;
    /// Start `ctr` on an idle worker of type `it`. `false` if none is idle.
    async fn start_container(&self, it: &InstanceType, ctr: &Container) -> bool;
    /// Ask the supervisor for `uuid` to stop. `true` if one is known.
    async fn kill_container(&self, uuid: &str, reason: &str) -> bool;
    /// Stop tracking the exit time of `uuid`.
    async fn forget_container(&self, uuid: &str);
    /// Containers with a known supervisor, with exit time if it exited.
    async fn running(&self) -> HashMap<String, Option<Instant>>;
    /// Shut down one unallocated worker of the named type.
    async fn shutdown(&self, instance_type: &str) -> bool;
    /// Worker counts by state.
    async fn count_workers(&self) -> BTreeMap<State, usize>;
    /// Whether the first instance listing has completed.
    async fn is_loaded(&self) -> bool;
    /// Change notifications.
    fn subscribe(&self) -> Subscription;
}

#[async_trait]
impl WorkerPool for Pool {
    async fn unallocated(&self) -> BTreeMap<String, usize> {
        Pool::unallocated(self).await
    }

    async fn at_quota(&self) -> bool {
        Pool::at_quota(self).await
    }

    async fn create(&self, it: &InstanceType) -> Result<(), PoolError> {
        Pool::create(self, it).await
    }

    async fn start_container(&self, it: &InstanceType, ctr: &Container) -> bool {
        Pool::start_container(self, it, ctr).await
    }

    async fn kill_container(&self, uuid: &str, reason: &str) -> bool {
        Pool::kill_container(self, uuid, reason).await
    }

    async fn forget_container(&self, uuid: &str) {
        Pool::forget_container(self, uuid).await
    }

    async fn running(&self) -> HashMap<String, Option<Instant>> {
        Pool::running(self).await
    }

    async fn shutdown(&self, instance_type: &str) -> bool {
        Pool::shutdown(self, instance_type).await
    }

    async fn count_workers(&self) -> BTreeMap<State, usize> {
        Pool::count_workers(self).await
    }

    async fn is_loaded(&self) -> bool {
        Pool::is_loaded(self).await
    }

    fn subscribe(&self) -> Subscription {
        Pool::subscribe(self)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Scheduler timing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between passes when nothing changes. The queue is also
    /// refreshed at this interval.
    /// Default: 1 second
    pub poll_interval: Duration,
    /// Longest wait at startup for workers to leave the Unknown state before
    /// releasing stale locks.
    /// Default: 1 minute
    pub stale_lock_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stale_lock_timeout: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Per-container operation tracking
// ============================================================================

/// At most one background operation per container.
#[derive(Clone, Default)]
struct UuidOps {
    in_progress: Arc<Mutex<HashMap<String, &'static str>>>,
    wakeup: Arc<Notify>,
}

/// Holds a container's operation slot until dropped.
struct OpGuard {
    ops: UuidOps,
    uuid: String,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.ops.end(&self.uuid);
    }
}

impl UuidOps {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, &'static str>> {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `uuid` for `op`. When another operation holds it, schedule a
    /// wakeup so the caller's decision is revisited shortly.
    fn begin(&self, uuid: &str, op: &'static str) -> Option<OpGuard> {
        let mut ops = self.slots();
        if let Some(current) = ops.get(uuid) {
            debug!(
                container_uuid = uuid,
                requested = op,
                in_progress = *current,
                "operation already in progress"
            );
            let wakeup = self.wakeup.clone();
            tokio::spawn(async move {
                sleep(OP_RETRY_DELAY).await;
                wakeup.notify_one();
            });
            return None;
        }
        ops.insert(uuid.to_string(), op);
        Some(OpGuard {
            ops: self.clone(),
            uuid: uuid.to_string(),
        })
    }

    fn end(&self, uuid: &str) {
        self.slots().remove(uuid);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Drives containers from the queue onto the worker pool.
pub struct Scheduler {
    queue: Arc<dyn ContainerQueue>,
    pool: Arc<dyn WorkerPool>,
    config: SchedulerConfig,
    ops: UuidOps,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a scheduler over `queue` and `pool`.
    pub fn new(
        queue: Arc<dyn ContainerQueue>,
        pool: Arc<dyn WorkerPool>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            config,
            ops: UuidOps::default(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle that stops [`Scheduler::run`] when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until the shutdown handle is notified.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Scheduler started"
        );

        if !self.initial_update().await {
            info!("Scheduler stopped");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduling = async {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {}
                _ = self.schedule() => {}
            }
            stop_tx.send_replace(true);
        };
        tokio::join!(self.update_periodically(stop_rx), scheduling);

        info!("Scheduler stopped");
    }

    /// Retry until the queue loads once. Returns `false` on shutdown.
    async fn initial_update(&self) -> bool {
        let delay = (self.config.poll_interval / 10).max(Duration::from_secs(1));
        loop {
            match self.queue.update().await {
                Ok(()) => return true,
                Err(err) => {
                    error!(
                        error = %err,
                        retry_ms = delay.as_millis() as u64,
                        "error updating queue"
                    );
                }
            }
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => return false,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn update_periodically(&self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = stop.wait_for(|s| *s) => return,
                _ = sleep(self.config.poll_interval) => {}
            }
            let started = Instant::now();
            match self.queue.update().await {
                Ok(()) => debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "queue updated"
                ),
                Err(err) => error!(error = %err, "error updating queue"),
            }
        }
    }

    async fn schedule(&self) {
        let started = Instant::now();
        self.fix_stale_locks().await;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stale locks fixed"
        );

        let mut queue_changes = self.queue.subscribe();
        let mut pool_changes = self.pool.subscribe();
        loop {
            self.run_queue().await;
            self.sync().await;
            tokio::select! {
                _ = queue_changes.changed() => {}
                _ = pool_changes.changed() => {}
                _ = self.ops.wakeup.notified() => {}
                _ = sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Release locks held by this dispatcher's token for containers that no
    /// worker is running.
    ///
    /// Waits, at most `stale_lock_timeout`, for the pool to load and for every
    /// worker to leave the Unknown state, so supervisors that are still
    /// running are not mistaken for stale locks.
    pub async fn fix_stale_locks(&self) {
        let mut changes = self.pool.subscribe();
        let deadline = sleep(self.config.stale_lock_timeout);
        tokio::pin!(deadline);
        loop {
            let unknown = self
                .pool
                .count_workers()
                .await
                .get(&State::Unknown)
                .copied()
                .unwrap_or(0);
            if self.pool.is_loaded().await && unknown == 0 {
                break;
            }
            tokio::select! {
                _ = changes.changed() => {}
                _ = &mut deadline => {
                    warn!(unknown, "timed out waiting for workers to be probed");
                    break;
                }
            }
        }

        let running = self.pool.running().await;
        let (entries, _) = self.queue.entries().await;
        for (uuid, ent) in entries {
            if ent.container.state != ContainerState::Locked || running.contains_key(&uuid) {
                continue;
            }
            info!(container_uuid = %uuid, "unlocking stale lock");
            if let Err(err) = self.queue.unlock(&uuid).await {
                warn!(container_uuid = %uuid, error = %err, "error unlocking stale lock");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Background operations
    // ------------------------------------------------------------------------

    fn spawn_op<F>(&self, uuid: &str, op: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(guard) = self.ops.begin(uuid, op) else {
            return;
        };
        tokio::spawn(async move {
            work.await;
            drop(guard);
        });
    }

    fn bg_lock(&self, uuid: &str) {
        let queue = self.queue.clone();
        let uuid_owned = uuid.to_string();
        self.spawn_op(uuid, "lock", async move {
            let uuid = uuid_owned;
            match queue.get(&uuid).await {
                Some(ctr) if ctr.state == ContainerState::Queued => {}
                Some(ctr) => {
                    debug!(container_uuid = %uuid, state = %ctr.state, "container no longer queued, not locking");
                    return;
                }
                None => return,
            }
            if let Err(err) = queue.lock(&uuid).await {
                warn!(container_uuid = %uuid, error = %err, "error locking container");
                return;
            }
            match queue.get(&uuid).await {
                Some(ctr) if ctr.state == ContainerState::Locked => {
                    debug!(container_uuid = %uuid, "container locked");
                }
                Some(ctr) => {
                    warn!(container_uuid = %uuid, state = %ctr.state, "container state changed after lock (race?)");
                }
                None => {}
            }
        });
    }

    fn bg_unlock(&self, uuid: &str, reason: &'static str) {
        let queue = self.queue.clone();
        let uuid_owned = uuid.to_string();
        self.spawn_op(uuid, "unlock", async move {
            let uuid = uuid_owned;
            info!(container_uuid = %uuid, reason, "unlocking container");
            if let Err(err) = queue.unlock(&uuid).await {
                warn!(container_uuid = %uuid, error = %err, "error unlocking container");
            }
        });
    }

    fn bg_cancel(&self, uuid: &str, reason: &'static str) {
        let queue = self.queue.clone();
        let uuid_owned = uuid.to_string();
        self.spawn_op(uuid, "cancel", async move {
            let uuid = uuid_owned;
            info!(container_uuid = %uuid, reason, "cancelling container");
            if let Err(err) = queue.cancel(&uuid).await {
                warn!(container_uuid = %uuid, error = %err, "error cancelling container");
            }
        });
    }

    fn bg_kill(&self, uuid: &str, reason: String) {
        let pool = self.pool.clone();
        let uuid_owned = uuid.to_string();
        self.spawn_op(uuid, "kill", async move {
            let uuid = uuid_owned;
            pool.kill_container(&uuid, &reason).await;
            pool.forget_container(&uuid).await;
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::container::stub::StubControlPlane;
    use crate::container::{QueueConfig, RuntimeConstraints};
    use crate::notify::Notifier;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    pub(crate) const TOKEN_UUID: &str = "zzzzz-gj3su-000000000000000";
    const GIB: i64 = 1 << 30;

    /// Pool double with scripted answers and a call log.
    #[derive(Default)]
    pub(crate) struct FakePoolState {
        pub unalloc: BTreeMap<String, usize>,
        pub at_quota: bool,
        pub create_fails: bool,
        pub start_ok: bool,
        pub running: HashMap<String, Option<Instant>>,
        pub lingering: HashSet<String>,
        pub workers: BTreeMap<State, usize>,
        pub loaded: bool,
        pub creates: Vec<String>,
        pub starts: Vec<String>,
        pub kills: Vec<(String, String)>,
        pub forgets: Vec<String>,
        pub shutdowns: Vec<String>,
    }

    #[derive(Default)]
    pub(crate) struct FakePool {
        pub state: Mutex<FakePoolState>,
        pub notifier: Notifier,
    }

    impl FakePool {
        pub(crate) fn loaded() -> Arc<Self> {
            let pool = Self::default();
            pool.state.try_lock().unwrap().loaded = true;
            Arc::new(pool)
        }
    }

    #[async_trait]
    impl WorkerPool for FakePool {
        async fn unallocated(&self) -> BTreeMap<String, usize> {
            self.state.lock().await.unalloc.clone()
        }

        async fn at_quota(&self) -> bool {
            self.state.lock().await.at_quota
        }

        async fn create(&self, it: &InstanceType) -> Result<(), PoolError> {
            let mut state = self.state.lock().await;
            if state.create_fails {
                return Err(PoolError::AtQuota);
            }
            state.creates.push(it.name.clone());
            Ok(())
        }

        async fn start_container(&self, _it: &InstanceType, ctr: &Container) -> bool {
            let mut state = self.state.lock().await;
            if !state.start_ok {
                return false;
            }
            state.starts.push(ctr.uuid.clone());
            state.running.insert(ctr.uuid.clone(), None);
            true
        }

        async fn kill_container(&self, uuid: &str, reason: &str) -> bool {
            let mut state = self.state.lock().await;
            state.kills.push((uuid.to_string(), reason.to_string()));
            state.running.contains_key(uuid) || state.lingering.contains(uuid)
        }

        async fn forget_container(&self, uuid: &str) {
            self.state.lock().await.forgets.push(uuid.to_string());
        }

        async fn running(&self) -> HashMap<String, Option<Instant>> {
            self.state.lock().await.running.clone()
        }

        async fn shutdown(&self, instance_type: &str) -> bool {
            self.state
                .lock()
                .await
                .shutdowns
                .push(instance_type.to_string());
            true
        }

        async fn count_workers(&self) -> BTreeMap<State, usize> {
            self.state.lock().await.workers.clone()
        }

        async fn is_loaded(&self) -> bool {
            self.state.lock().await.loaded
        }

        fn subscribe(&self) -> Subscription {
            self.notifier.subscribe()
        }
    }

    pub(crate) fn types() -> BTreeMap<String, InstanceType> {
        let mk = |name: &str, vcpus: i64, price: f64| InstanceType {
            name: name.into(),
            provider_type: format!("p-{}", name),
            vcpus,
            ram: vcpus * 2 * GIB,
            scratch: 0,
            price,
            preemptible: false,
        };
        BTreeMap::from([
            ("small".to_string(), mk("small", 1, 0.1)),
            ("big".to_string(), mk("big", 8, 1.0)),
        ])
    }

    pub(crate) fn ctr(uuid: &str, state: ContainerState, priority: i64, vcpus: i64) -> Container {
        let locked = matches!(state, ContainerState::Locked | ContainerState::Running);
        Container {
            uuid: uuid.into(),
            state,
            priority,
            locked_by_uuid: locked.then(|| TOKEN_UUID.to_string()),
            runtime_constraints: RuntimeConstraints {
                vcpus,
                ram: GIB / 2,
                keep_cache_ram: 0,
            },
            ..Default::default()
        }
    }

    pub(crate) async fn setup(
        containers: Vec<Container>,
        pool: Arc<FakePool>,
    ) -> (StubControlPlane, Arc<Queue>, Scheduler) {
        let cp = StubControlPlane::new(TOKEN_UUID);
        for c in containers {
            cp.put(c).await;
        }
        let queue = Arc::new(Queue::new(
            Arc::new(cp.clone()),
            types(),
            QueueConfig::default(),
        ));
        queue.update().await.unwrap();
        let sched = Scheduler::new(queue.clone(), pool, SchedulerConfig::default());
        (cp, queue, sched)
    }

    /// Let background operations finish.
    pub(crate) async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_uuid_ops_refuse_concurrent_operation() {
        let ops = UuidOps::default();
        let c1 = ops.begin("c1", "lock").unwrap();
        assert!(ops.begin("c1", "cancel").is_none());
        let _c2 = ops.begin("c2", "cancel").unwrap();

        let wakeup = ops.wakeup.clone();
        let woken = tokio::spawn(async move { wakeup.notified().await });
        tokio::time::sleep(OP_RETRY_DELAY + Duration::from_millis(1)).await;
        assert!(woken.is_finished());

        drop(c1);
        assert!(ops.begin("c1", "cancel").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_slot_claimed_before_task_runs() {
        let c1 = ctr("zzzzz-dz642-000000000000001", ContainerState::Queued, 1, 1);
        let uuid = c1.uuid.clone();
        let (cp, _queue, sched) = setup(vec![c1], FakePool::loaded()).await;

        sched.bg_lock(&uuid);
        assert_eq!(sched.ops.slots().get(&uuid), Some(&"lock"));
        sched.bg_lock(&uuid);
        sched.bg_cancel(&uuid, "test");

        settle().await;
        assert_eq!(cp.calls("lock").await, 1);
        assert_eq!(cp.calls("update").await, 0);
        assert!(sched.ops.slots().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_locks_released_once_workers_probed() {
        let pool = FakePool::loaded();
        {
            let mut state = pool.state.lock().await;
            state.workers.insert(State::Unknown, 1);
            state.running.insert("c-running".into(), None);
        }
        let (cp, _queue, sched) = setup(
            vec![
                ctr("c-stale-1", ContainerState::Locked, 1, 1),
                ctr("c-stale-2", ContainerState::Locked, 1, 1),
                ctr("c-running", ContainerState::Locked, 1, 1),
            ],
            pool.clone(),
        )
        .await;

        let sched = Arc::new(sched);
        let task = tokio::spawn({
            let sched = sched.clone();
            async move { sched.fix_stale_locks().await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!task.is_finished());
        assert_eq!(cp.calls("unlock").await, 0);

        pool.state.lock().await.workers.clear();
        pool.notifier.notify();
        task.await.unwrap();

        assert_eq!(cp.container("c-stale-1").await.unwrap().state, ContainerState::Queued);
        assert_eq!(cp.container("c-stale-2").await.unwrap().state, ContainerState::Queued);
        assert_eq!(cp.container("c-running").await.unwrap().state, ContainerState::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lock_wait_is_bounded() {
        let pool = Arc::new(FakePool::default());
        let (cp, _queue, sched) =
            setup(vec![ctr("c1", ContainerState::Locked, 1, 1)], pool).await;
        let started = Instant::now();
        sched.fix_stale_locks().await;
        assert_eq!(started.elapsed(), SchedulerConfig::default().stale_lock_timeout);
        assert_eq!(cp.container("c1").await.unwrap().state, ContainerState::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_initial_update_and_stops() {
        let pool = FakePool::loaded();
        let cp = StubControlPlane::new(TOKEN_UUID);
        cp.put(ctr("c1", ContainerState::Queued, 1, 1)).await;
        cp.fail_lists(2).await;
        let queue = Arc::new(Queue::new(
            Arc::new(cp.clone()),
            types(),
            QueueConfig::default(),
        ));
        pool.state.lock().await.unalloc.insert("small".into(), 1);
        let sched = Arc::new(Scheduler::new(queue.clone(), pool.clone(), SchedulerConfig::default()));
        let shutdown = sched.shutdown_handle();
        let task = tokio::spawn({
            let sched = sched.clone();
            async move { sched.run().await }
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        settle().await;
        assert_eq!(cp.container("c1").await.unwrap().state, ContainerState::Locked);

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
