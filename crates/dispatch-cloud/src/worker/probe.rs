// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-worker state and the boot/run probes.
//!
//! Every method on [`Worker`] is called with the pool lock held. Remote work
//! (destroy, set tags, closing an executor) is spawned so the lock is never
//! held across a provider or SSH call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dispatch_cloud_driver::{Instance, InstanceId, InstanceType};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::pool::{Pool, PoolConfig, PoolState, sudo};
use super::runner::RemoteRunner;
use super::{IdleBehavior, State, tag_keys};
use crate::config::Timeouts;
use crate::executor::Executor;

/// The pool's record for one instance.
pub(crate) struct Worker {
    pub(crate) instance: Arc<dyn Instance>,
    pub(crate) instance_type: InstanceType,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) state: State,
    pub(crate) idle_behavior: IdleBehavior,
    pub(crate) appeared: Instant,
    pub(crate) probed: Instant,
    pub(crate) updated: Instant,
    pub(crate) busy: Instant,
    pub(crate) destroyed: Option<Instant>,
    pub(crate) last_uuid: String,
    /// Supervisors confirmed by a probe.
    pub(crate) running: HashMap<String, Arc<RemoteRunner>>,
    /// Supervisors started here and not yet seen by a probe.
    pub(crate) starting: HashMap<String, Arc<RemoteRunner>>,
    /// Entries of `starting` whose start command returned.
    pub(crate) launched: HashSet<String>,
    pub(crate) probing: Arc<Semaphore>,
    pub(crate) stale_run_lock_since: Option<Instant>,
}

impl Worker {
    pub(crate) fn new(
        instance: Arc<dyn Instance>,
        instance_type: InstanceType,
        executor: Arc<dyn Executor>,
        state: State,
        idle_behavior: IdleBehavior,
        now: Instant,
    ) -> Self {
        Self {
            instance,
            instance_type,
            executor,
            state,
            idle_behavior,
            appeared: now,
            probed: now,
            updated: now,
            busy: now,
            destroyed: None,
            last_uuid: String::new(),
            running: HashMap::new(),
            starting: HashMap::new(),
            launched: HashSet::new(),
            probing: Arc::new(Semaphore::new(1)),
            stale_run_lock_since: None,
        }
    }

    fn id(&self) -> InstanceId {
        self.instance.id()
    }

    fn busy_count(&self) -> usize {
        self.running.len() + self.starting.len()
    }

    /// Mark the worker `Shutdown` and destroy its instance in the background.
    pub(crate) fn shutdown(&mut self, pool: &Pool) {
        let now = Instant::now();
        self.updated = now;
        self.destroyed = Some(now);
        self.state = State::Shutdown;
        pool.notify();

        let instance = self.instance.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(err) = instance.destroy().await {
                warn!(instance_id = %instance.id(), error = %err, "shutdown failed");
                return;
            }
            // Quota may have been freed.
            pool.inner.state.lock().await.at_quota_until = None;
            pool.notify();
        });
    }

    /// Shut down if probes have been failing for too long. Returns whether it did.
    pub(crate) fn shutdown_if_broken(&mut self, pool: &Pool, failing_for: Duration) -> bool {
        if self.idle_behavior == IdleBehavior::Hold {
            return false;
        }
        let timeouts = &pool.inner.config.timeouts;
        let (label, threshold) = match self.state {
            State::Unknown | State::Booting => ("new ", timeouts.booting),
            _ => ("", timeouts.probe),
        };
        if failing_for < threshold {
            return false;
        }
        warn!(
            instance_id = %self.id(),
            state = %self.state,
            failing_secs = failing_for.as_secs(),
            "{}instance unresponsive, shutting down",
            label
        );
        self.shutdown(pool);
        true
    }

    pub(crate) fn eligible_for_shutdown(&self, timeouts: &Timeouts) -> bool {
        if self.idle_behavior == IdleBehavior::Hold {
            return false;
        }
        let draining = self.idle_behavior == IdleBehavior::Drain;
        match self.state {
            State::Booting => draining,
            State::Idle => draining || self.busy.elapsed() >= timeouts.idle,
            State::Running => {
                draining
                    && self
                        .running
                        .values()
                        .chain(self.starting.values())
                        .all(|rr| rr.given_up())
            }
            State::Unknown | State::Shutdown => false,
        }
    }

    /// Shut down if idle too long or drained. Returns whether it did.
    pub(crate) fn shutdown_if_idle(&mut self, pool: &Pool) -> bool {
        if !self.eligible_for_shutdown(&pool.inner.config.timeouts) {
            return false;
        }
        info!(
            instance_id = %self.id(),
            state = %self.state,
            idle_secs = self.busy.elapsed().as_secs(),
            idle_behavior = %self.idle_behavior,
            "shutdown worker"
        );
        self.shutdown(pool);
        true
    }

    /// Write the type and idle behavior tags if the instance lacks them.
    pub(crate) fn save_tags(&self, config: &PoolConfig) {
        let mut tags = self.instance.tags();
        let mut save = false;
        for (key, value) in [
            (tag_keys::INSTANCE_TYPE, self.instance_type.name.as_str()),
            (tag_keys::IDLE_BEHAVIOR, self.idle_behavior.as_str()),
        ] {
            let key = config.tag(key);
            if tags.get(&key).map(String::as_str) != Some(value) {
                tags.insert(key, value.to_string());
                save = true;
            }
        }
        if !save {
            return;
        }
        let instance = self.instance.clone();
        tokio::spawn(async move {
            if let Err(err) = instance.set_tags(tags).await {
                warn!(instance_id = %instance.id(), error = %err, "error updating tags");
            }
        });
    }

    pub(crate) fn set_idle_behavior(&mut self, pool: &Pool, behavior: IdleBehavior) {
        info!(instance_id = %self.id(), idle_behavior = %behavior, "set idle behavior");
        self.idle_behavior = behavior;
        self.save_tags(&pool.inner.config);
        self.shutdown_if_idle(pool);
    }

    /// Forget a supervisor that has exited, recording it in `exited`.
    pub(crate) fn close_runner(&mut self, uuid: &str, exited: &mut HashMap<String, Instant>) {
        let Some(rr) = self
            .running
            .remove(uuid)
            .or_else(|| self.starting.remove(uuid))
        else {
            return;
        };
        info!(instance_id = %self.id(), container_uuid = %uuid, "supervisor process ended");
        self.launched.remove(uuid);
        rr.close();
        let now = Instant::now();
        self.updated = now;
        exited.insert(uuid.to_string(), now);
        if self.state == State::Running && self.busy_count() == 0 {
            self.state = State::Idle;
        }
    }

    /// Reconcile `running` and `starting` with a probe's list. Returns
    /// whether anything changed.
    fn update_running(
        &mut self,
        pool: &Pool,
        listed: &[String],
        exited: &mut HashMap<String, Instant>,
    ) -> bool {
        let mut changed = false;
        let alive: HashSet<&str> = listed.iter().map(String::as_str).collect();
        for uuid in listed {
            if self.running.contains_key(uuid) {
                continue;
            }
            if let Some(rr) = self.starting.remove(uuid) {
                self.launched.remove(uuid);
                self.running.insert(uuid.clone(), rr);
            } else {
                info!(instance_id = %self.id(), container_uuid = %uuid, "supervisor process detected");
                let rr = pool.new_runner(self, uuid);
                self.running.insert(uuid.clone(), rr);
            }
            changed = true;
        }
        let ended: Vec<String> = self
            .running
            .keys()
            .chain(self.launched.iter())
            .filter(|uuid| !alive.contains(uuid.as_str()))
            .cloned()
            .collect();
        for uuid in ended {
            self.close_runner(&uuid, exited);
            changed = true;
        }
        changed
    }

    /// Abandon every runner and close the executor.
    pub(crate) fn close(&self) {
        for uuid in self.running.keys().chain(self.starting.keys()) {
            info!(instance_id = %self.id(), container_uuid = %uuid, "supervisor process abandoned");
        }
        for rr in self.running.values().chain(self.starting.values()) {
            rr.close();
        }
        let executor = self.executor.clone();
        tokio::spawn(async move { executor.close().await });
    }
}

// ============================================================================
// Probes
// ============================================================================

struct RunProbe {
    uuids: Vec<String>,
    broken: bool,
    ok: bool,
}

/// Run the probes `id` needs and apply the results.
///
/// Unknown workers get both probes, booting workers get the run probe once
/// booted, idle and running workers get only the run probe.
pub(crate) async fn probe_and_update(pool: &Pool, id: &InstanceId) {
    let (initial_state, updated, executor, remote_user) = {
        let state = pool.inner.state.lock().await;
        let Some(w) = state.workers.get(id) else {
            return;
        };
        (
            w.state,
            w.updated,
            w.executor.clone(),
            w.instance.remote_user(),
        )
    };
    let mut booted = match initial_state {
        State::Shutdown => return,
        State::Idle | State::Running => true,
        State::Unknown | State::Booting => false,
    };

    let probe_start = Instant::now();
    let mut boot_stderr = Vec::new();
    if !booted {
        let (ok, stderr) = probe_booted(pool, id, executor.as_ref()).await;
        booted = ok;
        boot_stderr = stderr;
        if !booted {
            // A concurrent probe may have succeeded.
            let state = pool.inner.state.lock().await;
            booted = state
                .workers
                .get(id)
                .is_some_and(|w| matches!(w.state, State::Idle | State::Running));
        }
        if booted {
            info!(instance_id = %id, "instance booted; will try run probe");
        }
    }

    let mut run = RunProbe {
        uuids: Vec::new(),
        broken: false,
        ok: false,
    };
    if booted || initial_state == State::Unknown {
        run = probe_running(pool, id, executor.as_ref(), &remote_user).await;
    }

    let mut state = pool.inner.state.lock().await;
    let PoolState {
        workers, exited, ..
    } = &mut *state;
    let Some(w) = workers.get_mut(id) else {
        return;
    };
    if w.state == State::Shutdown {
        return;
    }
    if run.broken && w.idle_behavior == IdleBehavior::Run {
        info!(instance_id = %id, "probe reported broken instance");
        w.set_idle_behavior(pool, IdleBehavior::Drain);
        if w.state == State::Shutdown {
            return;
        }
    }
    if !run.ok || (!booted && run.uuids.is_empty() && w.running.is_empty()) {
        // Measured from the probe start so at least one probe runs after the
        // timeout expires.
        let failing_for = probe_start.saturating_duration_since(w.probed);
        if w.shutdown_if_broken(pool, failing_for) && !booted {
            info!(
                instance_id = %id,
                failing_secs = failing_for.as_secs(),
                stderr = %String::from_utf8_lossy(&boot_stderr),
                "boot failed"
            );
        }
        return;
    }

    let now = Instant::now();
    w.probed = now;
    if w.updated != updated {
        // Running list may predate a start or a sync; wait for the next probe.
        debug!(instance_id = %id, "skipping worker state update due to probe/sync race");
        return;
    }

    if let Some(first) = run.uuids.first() {
        w.busy = now;
        w.last_uuid = first.clone();
    } else if !w.running.is_empty() {
        w.busy = now;
    }

    let mut changed = w.update_running(pool, &run.uuids, exited);
    if booted && matches!(w.state, State::Unknown | State::Booting) {
        w.state = State::Idle;
        changed = true;
    }
    if !changed {
        return;
    }
    if w.state == State::Unknown {
        info!(
            instance_id = %id,
            running = w.running.len(),
            "run probe succeeded, but boot probe is still failing"
        );
    }
    if w.state == State::Idle && w.busy_count() > 0 {
        w.state = State::Running;
    } else if w.state == State::Running && w.busy_count() == 0 {
        w.state = State::Idle;
    }
    w.updated = now;
    if booted && matches!(initial_state, State::Unknown | State::Booting) {
        info!(
            instance_id = %id,
            running = w.running.len(),
            state = %w.state,
            "probes succeeded, instance is in service"
        );
    }
    drop(state);
    pool.notify();
}

async fn probe_booted(pool: &Pool, id: &InstanceId, executor: &dyn Executor) -> (bool, Vec<u8>) {
    let cmd = &pool.inner.config.boot_probe_command;
    match executor.execute(&Default::default(), cmd, None).await {
        Ok(out) => {
            info!(instance_id = %id, command = %cmd, "boot probe succeeded");
            (true, out.stderr)
        }
        Err(err) => {
            debug!(instance_id = %id, command = %cmd, error = %err, "boot probe failed");
            (false, err.to_string().into_bytes())
        }
    }
}

async fn probe_running(
    pool: &Pool,
    id: &InstanceId,
    executor: &dyn Executor,
    remote_user: &str,
) -> RunProbe {
    let config = &pool.inner.config;
    let cmd = sudo(remote_user, &format!("{} --list", config.supervisor_command));
    let mut probe = RunProbe {
        uuids: Vec::new(),
        broken: false,
        ok: false,
    };
    let stdout = match executor.execute(&Default::default(), &cmd, None).await {
        Ok(out) => out.stdout,
        Err(err) => {
            warn!(instance_id = %id, command = %cmd, error = %err, "probe failed");
            return probe;
        }
    };
    debug!(instance_id = %id, command = %cmd, "probe succeeded");
    probe.ok = true;

    let (uuids, broken, stale) = parse_list(&String::from_utf8_lossy(&stdout), &config.cluster_id);
    for uuid in &stale {
        info!(instance_id = %id, container_uuid = %uuid, "probe reported stale run lock");
    }
    probe.uuids = uuids;
    probe.broken = broken;

    let mut state = pool.inner.state.lock().await;
    if let Some(w) = state.workers.get_mut(id) {
        let now = Instant::now();
        match (stale.is_empty(), w.stale_run_lock_since) {
            (true, _) => w.stale_run_lock_since = None,
            (false, None) => w.stale_run_lock_since = Some(now),
            (false, Some(since)) => {
                let held = now.saturating_duration_since(since);
                if held > config.timeouts.stale_run_lock {
                    warn!(
                        instance_id = %id,
                        stale_secs = held.as_secs(),
                        "reporting broken after reporting stale run lock for too long"
                    );
                    probe.broken = true;
                }
            }
        }
    }
    probe
}

/// Split `--list` output into running UUIDs, the broken flag, and UUIDs
/// holding stale run locks.
fn parse_list(stdout: &str, cluster_id: &str) -> (Vec<String>, bool, Vec<String>) {
    let mut uuids = Vec::new();
    let mut stale = Vec::new();
    let mut broken = false;
    for line in stdout.lines() {
        if line.is_empty() {
            continue;
        }
        if line == "broken" {
            broken = true;
            continue;
        }
        if !line.starts_with(cluster_id) {
            continue;
        }
        let mut toks = line.split(' ');
        let uuid = toks.next().unwrap_or_default();
        match toks.next() {
            None => uuids.push(uuid.to_string()),
            Some("stale") => stale.push(uuid.to_string()),
            Some(_) => {}
        }
    }
    (uuids, broken, stale)
}
