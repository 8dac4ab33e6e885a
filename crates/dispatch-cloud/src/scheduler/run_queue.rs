// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Priority-ordered allocation of workers to containers.

use std::collections::HashSet;

use tracing::{debug, info};

use super::Scheduler;
use crate::container::{ContainerState, QueueEnt};

impl Scheduler {
    /// One pass over the queue in priority order.
    ///
    /// Queued containers are locked while capacity may exist. Locked
    /// containers consume an unallocated worker of their type, or trigger a
    /// create when none is left. The first container that cannot be served
    /// at quota ends the pass: it and every lower-priority locked container
    /// are unlocked, and leftover unallocated workers are shut down so the
    /// quota can be spent on the blocked head of the line.
    pub async fn run_queue(&self) {
        let (entries, _) = self.queue.entries().await;
        let mut sorted: Vec<QueueEnt> = entries.into_values().collect();
        sorted.sort_by(|a, b| {
            b.container
                .priority
                .cmp(&a.container.priority)
                .then_with(|| a.first_seen_at.cmp(&b.first_seen_at))
        });

        let running = self.pool.running().await;
        let mut unalloc = self.pool.unallocated().await;
        debug!(
            containers = sorted.len(),
            processes = running.len(),
            "running queue"
        );

        let mut dontstart: HashSet<String> = HashSet::new();
        let mut overquota: &[QueueEnt] = &[];
        let mut not_started = 0usize;

        for (i, ent) in sorted.iter().enumerate() {
            let ctr = &ent.container;
            let it = &ent.instance_type;
            if running.contains_key(&ctr.uuid) || ctr.priority < 1 {
                continue;
            }
            let available = unalloc.get(&it.name).copied().unwrap_or(0);
            match ctr.state {
                ContainerState::Queued => {
                    if available < 1 && self.pool.at_quota().await {
                        debug!(container_uuid = %ctr.uuid, instance_type = %it.name, "not locking: at quota");
                        overquota = &sorted[i..];
                        break;
                    }
                    if self.pool.kill_container(&ctr.uuid, "about to lock").await {
                        info!(container_uuid = %ctr.uuid, "not locking: supervisor from previous attempt has not exited");
                        continue;
                    }
                    self.bg_lock(&ctr.uuid);
                    unalloc.insert(it.name.clone(), available.saturating_sub(1));
                }
                ContainerState::Locked => {
                    if available > 0 {
                        unalloc.insert(it.name.clone(), available - 1);
                    } else if self.pool.at_quota().await {
                        debug!(container_uuid = %ctr.uuid, instance_type = %it.name, "not starting: at quota");
                        overquota = &sorted[i..];
                        break;
                    } else {
                        info!(container_uuid = %ctr.uuid, instance_type = %it.name, "creating new instance");
                        if let Err(err) = self.pool.create(it).await {
                            info!(container_uuid = %ctr.uuid, instance_type = %it.name, error = %err, "create failed");
                            overquota = &sorted[i..];
                            break;
                        }
                    }

                    if dontstart.contains(&it.name) {
                        // A worker of this type already refused a start
                        // during this pass.
                    } else if self.pool.kill_container(&ctr.uuid, "about to start").await {
                        info!(container_uuid = %ctr.uuid, "not restarting yet: supervisor from previous attempt has not exited");
                    } else if !self.pool.start_container(it, ctr).await {
                        not_started += 1;
                        dontstart.insert(it.name.clone());
                    }
                }
                _ => {}
            }
        }

        if !overquota.is_empty() {
            for ent in overquota {
                if ent.container.state == ContainerState::Locked {
                    self.bg_unlock(
                        &ent.container.uuid,
                        "pool capacity is needed by higher priority containers",
                    );
                }
            }
            for (instance_type, n) in &unalloc {
                if *n >= 1 {
                    self.pool.shutdown(instance_type).await;
                }
            }
        }

        if not_started > 0 || !overquota.is_empty() {
            debug!(
                allocated_not_started = not_started,
                overquota = overquota.len(),
                "queue pass incomplete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{FakePool, ctr, settle, setup};
    use crate::container::ContainerState;

    #[tokio::test(start_paused = true)]
    async fn test_locks_queued_containers_while_capacity_exists() {
        let pool = FakePool::loaded();
        pool.state.lock().await.unalloc.insert("small".into(), 1);
        let (cp, _queue, sched) = setup(
            vec![
                ctr("c1", ContainerState::Queued, 2, 1),
                ctr("c2", ContainerState::Queued, 1, 1),
            ],
            pool.clone(),
        )
        .await;

        sched.run_queue().await;
        settle().await;

        assert_eq!(cp.container("c1").await.unwrap().state, ContainerState::Locked);
        // Not at quota, so c2 is locked too and will get a new instance.
        assert_eq!(cp.container("c2").await.unwrap().state, ContainerState::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_container_uses_idle_worker_or_creates() {
        let pool = FakePool::loaded();
        {
            let mut state = pool.state.lock().await;
            state.unalloc.insert("small".into(), 1);
            state.start_ok = true;
        }
        let (_cp, _queue, sched) = setup(
            vec![
                ctr("c1", ContainerState::Locked, 2, 1),
                ctr("c2", ContainerState::Locked, 1, 1),
            ],
            pool.clone(),
        )
        .await;

        sched.run_queue().await;

        let state = pool.state.lock().await;
        assert_eq!(state.creates, vec!["small".to_string()]);
        assert_eq!(state.starts, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_blocks_type_for_rest_of_pass() {
        let pool = FakePool::loaded();
        pool.state.lock().await.unalloc.insert("small".into(), 2);
        let (_cp, _queue, sched) = setup(
            vec![
                ctr("c1", ContainerState::Locked, 2, 1),
                ctr("c2", ContainerState::Locked, 1, 1),
            ],
            pool.clone(),
        )
        .await;

        sched.run_queue().await;

        let state = pool.state.lock().await;
        let about_to_start = state
            .kills
            .iter()
            .filter(|(_, reason)| reason == "about to start")
            .count();
        assert_eq!(about_to_start, 1);
        assert!(state.creates.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_head_of_line_blocking() {
        let pool = FakePool::loaded();
        {
            let mut state = pool.state.lock().await;
            state.unalloc.insert("small".into(), 1);
            state.at_quota = true;
        }
        let (cp, _queue, sched) = setup(
            vec![
                ctr("c-high", ContainerState::Queued, 10, 4),
                ctr("c-low", ContainerState::Locked, 1, 1),
            ],
            pool.clone(),
        )
        .await;

        sched.run_queue().await;
        settle().await;

        // The big container cannot be placed, so nothing below it is
        // started and the idle small worker is released.
        assert_eq!(cp.container("c-high").await.unwrap().state, ContainerState::Queued);
        assert_eq!(cp.container("c-low").await.unwrap().state, ContainerState::Queued);
        let state = pool.state.lock().await;
        assert!(state.starts.is_empty());
        assert!(state.creates.is_empty());
        assert_eq!(state.shutdowns, vec!["small".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_unlocks_and_stops_pass() {
        let pool = FakePool::loaded();
        pool.state.lock().await.create_fails = true;
        let (cp, _queue, sched) = setup(
            vec![
                ctr("c1", ContainerState::Locked, 2, 1),
                ctr("c2", ContainerState::Locked, 1, 1),
            ],
            pool.clone(),
        )
        .await;

        sched.run_queue().await;
        settle().await;

        assert_eq!(cp.container("c1").await.unwrap().state, ContainerState::Queued);
        assert_eq!(cp.container("c2").await.unwrap().state, ContainerState::Queued);
        assert!(pool.state.lock().await.starts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_previous_supervisor_delays_lock() {
        let pool = FakePool::loaded();
        {
            let mut state = pool.state.lock().await;
            state.unalloc.insert("small".into(), 1);
            state.lingering.insert("c1".into());
        }
        let (cp, _queue, sched) =
            setup(vec![ctr("c1", ContainerState::Queued, 1, 1)], pool.clone()).await;

        sched.run_queue().await;
        settle().await;
        assert_eq!(cp.container("c1").await.unwrap().state, ContainerState::Queued);
        assert!(
            pool.state
                .lock()
                .await
                .kills
                .iter()
                .any(|(uuid, reason)| uuid == "c1" && reason == "about to lock")
        );

        pool.state.lock().await.lingering.clear();
        sched.run_queue().await;
        settle().await;
        assert_eq!(cp.container("c1").await.unwrap().state, ContainerState::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_priority_is_skipped() {
        let pool = FakePool::loaded();
        pool.state.lock().await.start_ok = true;
        let (_cp, _queue, sched) =
            setup(vec![ctr("c1", ContainerState::Locked, 0, 1)], pool.clone()).await;
        sched.run_queue().await;
        let state = pool.state.lock().await;
        assert!(state.creates.is_empty());
        assert!(state.starts.is_empty());
    }
}
