// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cached mirror of the container queue.
//!
//! [`Queue`] presents only the containers this dispatcher may run, is
//! running, or has recently run. Reads ([`Queue::entries`], [`Queue::get`],
//! [`Queue::forget`]) use cached data and never touch the network. Mutations
//! ([`Queue::lock`], [`Queue::unlock`], [`Queue::cancel`]) and
//! [`Queue::update`] wait for the control plane.
//!
//! # Local writes win
//!
//! While an update is in flight, every UUID touched by a local mutation is
//! recorded in a `dontupdate` set. When the poll result is applied, those
//! UUIDs are skipped, so a response that was read before the mutation cannot
//! resurrect stale state.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dispatch_cloud_driver::InstanceType;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Gauge;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::api::{ApiError, ControlPlane, Filter, ListParams};
use super::chooser::choose_instance_type;
use super::{Container, ContainerState, QueueEnt};
use crate::notify::{Notifier, Subscription};

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Page size for list requests.
    /// Default: 1000
    pub list_limit: usize,
    /// Maximum UUIDs per lookup of missing containers.
    /// Default: 20
    pub lookup_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            list_limit: 1000,
            lookup_batch_size: 20,
        }
    }
}

#[derive(Default)]
struct QueueState {
    current: HashMap<String, QueueEnt>,
    updated: Option<Instant>,
    dontupdate: Option<HashSet<String>>,
    token_uuid: Option<String>,
    metric_keys: BTreeSet<(ContainerState, String)>,
}

struct QueueInner {
    api: Arc<dyn ControlPlane>,
    instance_types: BTreeMap<String, InstanceType>,
    config: QueueConfig,
    state: RwLock<QueueState>,
    update_lock: Mutex<()>,
    notifier: Notifier,
    entries_gauge: Gauge<u64>,
}

/// Cached view of the control plane's container queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    /// Create an empty queue.
    pub fn new(
        api: Arc<dyn ControlPlane>,
        instance_types: BTreeMap<String, InstanceType>,
        config: QueueConfig,
    ) -> Self {
        let meter = opentelemetry::global::meter("dispatch_cloud");
        let entries_gauge = meter
            .u64_gauge("queue_entries")
            .with_description("Number of active container entries in the controller database")
            .build();
        Self {
            inner: Arc::new(QueueInner {
                api,
                instance_types,
                config,
                state: RwLock::new(QueueState::default()),
                update_lock: Mutex::new(()),
                notifier: Notifier::new(),
                entries_gauge,
            }),
        }
    }

    /// Notifications for any change to the cached entries.
    pub fn subscribe(&self) -> Subscription {
        self.inner.notifier.subscribe()
    }

    /// All cached entries and the start time of the latest completed update.
    ///
    /// Every entry is at least as fresh as the returned threshold. A caller
    /// that wants to know whether a remote process's exit has reached the
    /// control plane must wait until the threshold passes the exit time.
    pub async fn entries(&self) -> (HashMap<String, QueueEnt>, Option<Instant>) {
        let state = self.inner.state.read().await;
        (state.current.clone(), state.updated)
    }

    /// The cached container record for `uuid`.
    pub async fn get(&self, uuid: &str) -> Option<Container> {
        let state = self.inner.state.read().await;
        state.current.get(uuid).map(|ent| ent.container.clone())
    }

    /// Drop a finished container from the cache.
    ///
    /// No-op unless the container is final or queued with priority zero.
    pub async fn forget(&self, uuid: &str) {
        let mut state = self.inner.state.write().await;
        let Some(ent) = state.current.get(uuid) else {
            return;
        };
        let c = &ent.container;
        if c.state.is_final() || (c.state == ContainerState::Queued && c.priority == 0) {
            let container_state = c.state;
            Self::del_ent(&mut state, uuid, container_state);
        }
    }

    /// Acquire the dispatch lock for `uuid`.
    pub async fn lock(&self, uuid: &str) -> Result<(), ApiError> {
        let resp = self.inner.api.lock(uuid).await?;
        self.update_with_resp(uuid, resp).await;
        Ok(())
    }

    /// Release the dispatch lock for `uuid`.
    pub async fn unlock(&self, uuid: &str) -> Result<(), ApiError> {
        let resp = self.inner.api.unlock(uuid).await?;
        self.update_with_resp(uuid, resp).await;
        Ok(())
    }

    /// Cancel `uuid`.
    pub async fn cancel(&self, uuid: &str) -> Result<(), ApiError> {
        let resp = self
            .inner
            .api
            .update_container(uuid, serde_json::json!({ "state": ContainerState::Cancelled }))
            .await?;
        self.update_with_resp(uuid, resp).await;
        Ok(())
    }

    async fn set_runtime_error(&self, uuid: &str, message: &str) -> Result<(), ApiError> {
        self.inner
            .api
            .update_container(
                uuid,
                serde_json::json!({ "runtime_status": { "error": message } }),
            )
            .await?;
        Ok(())
    }

    async fn update_with_resp(&self, uuid: &str, resp: Container) {
        let mut state = self.inner.state.write().await;
        if let Some(dontupdate) = state.dontupdate.as_mut() {
            dontupdate.insert(uuid.to_string());
        }
        // Lock/unlock responses lack runtime constraints, so an unknown
        // container cannot be added from them.
        let Some(ent) = state.current.get_mut(uuid) else {
            return;
        };
        ent.container.state = resp.state;
        ent.container.priority = resp.priority;
        ent.container.locked_by_uuid = resp.locked_by_uuid;
        self.record_metrics(&mut state);
        self.inner.notifier.notify();
    }

    /// Refresh the cache from the control plane.
    ///
    /// On failure the cache is left as it was.
    pub async fn update(&self) -> Result<(), ApiError> {
        let _serial = self.inner.update_lock.lock().await;
        let update_started = Instant::now();
        self.inner.state.write().await.dontupdate = Some(HashSet::new());

        let next = match self.poll().await {
            Ok(next) => next,
            Err(err) => {
                self.inner.state.write().await.dontupdate = None;
                return Err(err);
            }
        };

        let mut state = self.inner.state.write().await;
        let dontupdate = state.dontupdate.take().unwrap_or_default();
        for (uuid, ctr) in &next {
            if dontupdate.contains(uuid) {
                continue;
            }
            match state.current.get_mut(uuid) {
                Some(ent) => ent.container = ctr.clone(),
                None => self.add_ent(&mut state, ctr.clone()),
            }
        }
        let gone: Vec<(String, ContainerState)> = state
            .current
            .iter()
            .filter(|(uuid, _)| !dontupdate.contains(*uuid) && !next.contains_key(*uuid))
            .map(|(uuid, ent)| (uuid.clone(), ent.container.state))
            .collect();
        for (uuid, container_state) in gone {
            Self::del_ent(&mut state, &uuid, container_state);
        }
        state.updated = Some(update_started);
        self.record_metrics(&mut state);
        self.inner.notifier.notify();
        Ok(())
    }

    fn del_ent(state: &mut QueueState, uuid: &str, container_state: ContainerState) {
        info!(container_uuid = %uuid, state = %container_state, "dropping container from queue");
        state.current.remove(uuid);
    }

    fn add_ent(&self, state: &mut QueueState, ctr: Container) {
        let instance_type = match choose_instance_type(&self.inner.instance_types, &ctr) {
            Ok(it) => it,
            Err(err) => {
                if matches!(ctr.state, ContainerState::Queued | ContainerState::Locked) {
                    warn!(container_uuid = %ctr.uuid, error = %err, "cancel container with no suitable instance type");
                    self.cancel_unsatisfiable(ctr, err.to_string());
                }
                return;
            }
        };
        info!(
            container_uuid = %ctr.uuid,
            state = %ctr.state,
            priority = ctr.priority,
            instance_type = %instance_type.name,
            "adding container to queue"
        );
        state.current.insert(
            ctr.uuid.clone(),
            QueueEnt {
                container: ctr,
                instance_type,
                first_seen_at: Utc::now(),
            },
        );
    }

    /// Lock (if needed), record the reason, and cancel a container that no
    /// instance type can run.
    fn cancel_unsatisfiable(&self, ctr: Container, reason: String) {
        let queue = self.clone();
        tokio::spawn(async move {
            let uuid = ctr.uuid.as_str();
            // A runtime error can only be set on a locked container.
            if ctr.state == ContainerState::Queued {
                if let Err(err) = queue.lock(uuid).await {
                    warn!(container_uuid = %uuid, error = %err, "lock failed");
                    return;
                }
            }
            let result = match queue.set_runtime_error(uuid, &reason).await {
                Ok(()) => queue.cancel(uuid).await,
                Err(err) => Err(err),
            };
            let Err(err) = result else {
                return;
            };
            let lost_race = matches!(
                queue.inner.api.get_container(uuid).await,
                Ok(latest) if latest.state == ContainerState::Cancelled
            );
            if !lost_race {
                warn!(container_uuid = %uuid, error = %err, "error while trying to cancel unsatisfiable container");
            }
        });
    }

    async fn poll(&self) -> Result<HashMap<String, Container>, ApiError> {
        let token_uuid = {
            let cached = self.inner.state.read().await.token_uuid.clone();
            match cached {
                Some(uuid) => uuid,
                None => {
                    let uuid = self.inner.api.current_token_uuid().await?;
                    self.inner.state.write().await.token_uuid = Some(uuid.clone());
                    uuid
                }
            }
        };

        let mut next: HashMap<String, Container> = HashMap::new();
        let limit = Some(self.inner.config.list_limit);

        let mine = self
            .fetch_all(vec![Filter::new("locked_by_uuid", "=", token_uuid)], limit)
            .await?;
        next.extend(mine.into_iter().map(|c| (c.uuid.clone(), c)));

        let avail = self
            .fetch_all(
                vec![
                    Filter::new("state", "=", ContainerState::Queued.as_str()),
                    Filter::new("priority", ">", "0"),
                ],
                limit,
            )
            .await?;
        next.extend(avail.into_iter().map(|c| (c.uuid.clone(), c)));

        let mut missing: BTreeSet<String> = {
            let state = self.inner.state.read().await;
            state
                .current
                .iter()
                .filter(|(uuid, ent)| !next.contains_key(*uuid) && !ent.container.state.is_final())
                .map(|(uuid, _)| uuid.clone())
                .collect()
        };

        while !missing.is_empty() {
            let batch: Vec<String> = missing
                .iter()
                .take(self.inner.config.lookup_batch_size)
                .cloned()
                .collect();
            let ended = self
                .fetch_all(vec![Filter::new("uuid", "in", batch.clone())], None)
                .await?;
            if ended.is_empty() {
                // Only an empty answer proves deletion; a short page can be
                // a response size limit.
                let mut state = self.inner.state.write().await;
                for uuid in &batch {
                    warn!(container_uuid = %uuid, "container not found by controller (deleted?)");
                    missing.remove(uuid);
                    let container_state = state
                        .current
                        .get(uuid)
                        .map(|ent| ent.container.state)
                        .unwrap_or_default();
                    Self::del_ent(&mut state, uuid, container_state);
                }
                continue;
            }
            for ctr in ended {
                if !missing.remove(&ctr.uuid) {
                    error!(
                        container_uuid = %ctr.uuid,
                        requested = ?batch,
                        "server response did not match requested filters"
                    );
                    return Err(ApiError::Protocol(format!(
                        "server returned unrequested container {}",
                        ctr.uuid
                    )));
                }
                next.insert(ctr.uuid.clone(), ctr);
            }
        }
        Ok(next)
    }

    async fn fetch_all(
        &self,
        filters: Vec<Filter>,
        limit: Option<usize>,
    ) -> Result<Vec<Container>, ApiError> {
        let mut results = Vec::new();
        let mut params = ListParams::ordered_by_uuid(filters.clone(), limit);
        loop {
            let page = self.inner.api.list_containers(&params).await?;
            let Some(last) = page.last() else {
                break;
            };
            let mut next_filters = filters.clone();
            next_filters.push(Filter::new("uuid", ">", last.uuid.clone()));
            params.filters = next_filters;
            results.extend(page);
        }
        Ok(results)
    }

    fn record_metrics(&self, state: &mut QueueState) {
        let mut counts: BTreeMap<(ContainerState, String), u64> = state
            .metric_keys
            .iter()
            .map(|k| (k.clone(), 0))
            .collect();
        for ent in state.current.values() {
            *counts
                .entry((ent.container.state, ent.instance_type.name.clone()))
                .or_default() += 1;
        }
        for ((container_state, instance_type), n) in &counts {
            self.inner.entries_gauge.record(
                *n,
                &[
                    KeyValue::new("state", container_state.as_str()),
                    KeyValue::new("instance_type", instance_type.clone()),
                ],
            );
        }
        state.metric_keys = counts.into_keys().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::stub::StubControlPlane;
    use crate::container::RuntimeConstraints;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    const GIB: i64 = 1 << 30;

    fn types() -> BTreeMap<String, InstanceType> {
        let small = InstanceType {
            name: "small".into(),
            provider_type: "p-small".into(),
            vcpus: 2,
            ram: 4 * GIB,
            scratch: 0,
            price: 0.1,
            preemptible: false,
        };
        BTreeMap::from([(small.name.clone(), small)])
    }

    fn ctr(uuid: &str, state: ContainerState, priority: i64) -> Container {
        Container {
            uuid: uuid.into(),
            state,
            priority,
            runtime_constraints: RuntimeConstraints {
                vcpus: 1,
                ram: GIB,
                keep_cache_ram: 0,
            },
            ..Default::default()
        }
    }

    fn queue(cp: &StubControlPlane) -> Queue {
        Queue::new(Arc::new(cp.clone()), types(), QueueConfig::default())
    }

    #[tokio::test]
    async fn test_update_selects_runnable_containers() {
        let cp = StubControlPlane::default();
        cp.put(ctr("zzzzz-dz642-000000000000001", ContainerState::Queued, 1)).await;
        cp.put(ctr("zzzzz-dz642-000000000000002", ContainerState::Queued, 0)).await;
        let mut theirs = ctr("zzzzz-dz642-000000000000003", ContainerState::Locked, 1);
        theirs.locked_by_uuid = Some("zzzzz-gj3su-someoneelse0000".into());
        cp.put(theirs).await;
        let mut mine = ctr("zzzzz-dz642-000000000000004", ContainerState::Running, 1);
        mine.locked_by_uuid = Some("zzzzz-gj3su-000000000000000".into());
        cp.put(mine).await;

        let q = queue(&cp);
        let (ents, threshold) = q.entries().await;
        assert!(ents.is_empty());
        assert!(threshold.is_none());

        q.update().await.unwrap();
        let (ents, threshold) = q.entries().await;
        let mut uuids: Vec<_> = ents.keys().cloned().collect();
        uuids.sort();
        assert_eq!(
            uuids,
            vec!["zzzzz-dz642-000000000000001", "zzzzz-dz642-000000000000004"]
        );
        assert_eq!(ents["zzzzz-dz642-000000000000001"].instance_type.name, "small");
        assert!(threshold.is_some());
        assert_eq!(cp.calls("current").await, 1);

        q.update().await.unwrap();
        assert_eq!(cp.calls("current").await, 1, "token identity is cached");
        let (_, threshold2) = q.entries().await;
        assert!(threshold2 >= threshold);
    }

    #[tokio::test]
    async fn test_paging_by_uuid() {
        let cp = StubControlPlane::default();
        for i in 0..5 {
            cp.put(ctr(&format!("zzzzz-dz642-00000000000000{}", i), ContainerState::Queued, 1))
                .await;
        }
        let q = Queue::new(
            Arc::new(cp.clone()),
            types(),
            QueueConfig {
                list_limit: 2,
                ..Default::default()
            },
        );
        q.update().await.unwrap();
        assert_eq!(q.entries().await.0.len(), 5);
    }

    #[tokio::test]
    async fn test_final_containers_are_looked_up_then_forgotten() {
        let cp = StubControlPlane::default();
        cp.put(ctr("zzzzz-dz642-000000000000001", ContainerState::Queued, 1)).await;
        let q = queue(&cp);
        q.update().await.unwrap();

        cp.set_state("zzzzz-dz642-000000000000001", ContainerState::Complete).await;
        q.update().await.unwrap();
        let c = q.get("zzzzz-dz642-000000000000001").await.unwrap();
        assert_eq!(c.state, ContainerState::Complete);

        q.forget("zzzzz-dz642-000000000000001").await;
        assert!(q.get("zzzzz-dz642-000000000000001").await.is_none());
    }

    #[tokio::test]
    async fn test_forget_keeps_active_containers() {
        let cp = StubControlPlane::default();
        cp.put(ctr("zzzzz-dz642-000000000000001", ContainerState::Queued, 1)).await;
        let q = queue(&cp);
        q.update().await.unwrap();
        q.forget("zzzzz-dz642-000000000000001").await;
        assert!(q.get("zzzzz-dz642-000000000000001").await.is_some());
    }

    #[tokio::test]
    async fn test_deleted_container_is_dropped() {
        let cp = StubControlPlane::default();
        cp.put(ctr("zzzzz-dz642-000000000000001", ContainerState::Queued, 1)).await;
        let q = queue(&cp);
        q.update().await.unwrap();
        cp.delete("zzzzz-dz642-000000000000001").await;
        q.update().await.unwrap();
        assert!(q.entries().await.0.is_empty());
    }

    #[tokio::test]
    async fn test_lock_unlock_round_trip() {
        let cp = StubControlPlane::default();
        cp.put(ctr("zzzzz-dz642-000000000000001", ContainerState::Queued, 1)).await;
        let q = queue(&cp);
        q.update().await.unwrap();

        let mut sub = q.subscribe();
        q.lock("zzzzz-dz642-000000000000001").await.unwrap();
        assert!(sub.has_changed());
        assert_eq!(
            q.get("zzzzz-dz642-000000000000001").await.unwrap().state,
            ContainerState::Locked
        );
        q.unlock("zzzzz-dz642-000000000000001").await.unwrap();
        assert_eq!(
            q.get("zzzzz-dz642-000000000000001").await.unwrap().state,
            ContainerState::Queued
        );
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_cache_alone() {
        let cp = StubControlPlane::default();
        cp.put(ctr("zzzzz-dz642-000000000000001", ContainerState::Queued, 1)).await;
        let q = queue(&cp);
        q.update().await.unwrap();
        assert!(q.unlock("zzzzz-dz642-000000000000001").await.is_err());
        assert_eq!(
            q.get("zzzzz-dz642-000000000000001").await.unwrap().state,
            ContainerState::Queued
        );
    }

    #[tokio::test]
    async fn test_failed_update_keeps_cache() {
        let cp = StubControlPlane::default();
        cp.put(ctr("zzzzz-dz642-000000000000001", ContainerState::Queued, 1)).await;
        let q = queue(&cp);
        q.update().await.unwrap();
        let (_, before) = q.entries().await;

        cp.fail_lists(1).await;
        assert!(q.update().await.is_err());
        let (ents, after) = q.entries().await;
        assert_eq!(ents.len(), 1);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_unsatisfiable_container_is_cancelled() {
        let cp = StubControlPlane::default();
        let mut huge = ctr("zzzzz-dz642-000000000000009", ContainerState::Queued, 1);
        huge.runtime_constraints.ram = 1024 * GIB;
        cp.put(huge).await;
        let q = queue(&cp);
        q.update().await.unwrap();
        assert!(q.entries().await.0.is_empty());

        for _ in 0..100 {
            let c = cp.container("zzzzz-dz642-000000000000009").await.unwrap();
            if c.state == ContainerState::Cancelled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let c = cp.container("zzzzz-dz642-000000000000009").await.unwrap();
        assert_eq!(c.state, ContainerState::Cancelled);
        let msg = cp.runtime_error("zzzzz-dz642-000000000000009").await.unwrap();
        assert!(msg.contains("constraints not satisfiable"));
    }

    /// Returns a snapshot taken before blocking on a gate, so the response
    /// is stale by the time it arrives.
    struct GatedControlPlane {
        inner: StubControlPlane,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl ControlPlane for GatedControlPlane {
        async fn current_token_uuid(&self) -> Result<String, ApiError> {
            self.inner.current_token_uuid().await
        }
        async fn list_containers(&self, params: &ListParams) -> Result<Vec<Container>, ApiError> {
            let snapshot = self.inner.list_containers(params).await;
            let first_page = !params.filters.iter().any(|f| f.op == ">" && f.attr == "uuid");
            let queued_query = params.filters.iter().any(|f| f.attr == "state");
            if first_page && queued_query {
                self.entered.notify_one();
                self.gate.notified().await;
            }
            snapshot
        }
        async fn get_container(&self, uuid: &str) -> Result<Container, ApiError> {
            self.inner.get_container(uuid).await
        }
        async fn lock(&self, uuid: &str) -> Result<Container, ApiError> {
            self.inner.lock(uuid).await
        }
        async fn unlock(&self, uuid: &str) -> Result<Container, ApiError> {
            self.inner.unlock(uuid).await
        }
        async fn update_container(
            &self,
            uuid: &str,
            attrs: serde_json::Value,
        ) -> Result<Container, ApiError> {
            self.inner.update_container(uuid, attrs).await
        }
    }

    #[tokio::test]
    async fn test_local_lock_survives_in_flight_update() {
        let stub = StubControlPlane::default();
        stub.put(ctr("zzzzz-dz642-000000000000001", ContainerState::Queued, 1)).await;
        let first = Queue::new(Arc::new(stub.clone()), types(), QueueConfig::default());
        first.update().await.unwrap();

        let gated = Arc::new(GatedControlPlane {
            inner: stub.clone(),
            entered: Notify::new(),
            gate: Notify::new(),
        });
        let q = Queue::new(gated.clone(), types(), QueueConfig::default());
        // Seed the cache without the gate.
        {
            let ents = first.entries().await.0;
            let mut state = q.inner.state.write().await;
            state.current = ents;
        }

        let updating = {
            let q = q.clone();
            tokio::spawn(async move { q.update().await })
        };
        gated.entered.notified().await;
        q.lock("zzzzz-dz642-000000000000001").await.unwrap();
        gated.gate.notify_one();
        updating.await.unwrap().unwrap();

        assert_eq!(
            q.get("zzzzz-dz642-000000000000001").await.unwrap().state,
            ContainerState::Locked
        );
    }
}
