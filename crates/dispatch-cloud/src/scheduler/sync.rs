// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation of queue state with supervisor state.

use tracing::info;

use super::Scheduler;
use crate::container::ContainerState;
use crate::worker::State;

impl Scheduler {
    /// Resolve disagreements between the queue and the pool.
    ///
    /// | queue state         | pool                               | action  |
    /// |---------------------|------------------------------------|---------|
    /// | Running             | not running, no Unknown workers    | cancel  |
    /// | Running             | exited before the last queue poll  | cancel  |
    /// | Running             | running, priority 0                | kill    |
    /// | Complete, Cancelled | running                            | kill    |
    /// | Complete, Cancelled | not running                        | forget  |
    /// | Queued              | running                            | kill    |
    /// | Queued              | not running, priority 0            | forget  |
    /// | Locked              | exited before the last queue poll  | requeue |
    /// | Locked              | running, priority 0                | kill    |
    /// | Locked              | not running, priority 0            | requeue |
    ///
    /// Comparing exit times with the queue's last poll avoids acting on a
    /// state that was read before the supervisor's final update landed.
    pub async fn sync(&self) {
        let any_unknown = self
            .pool
            .count_workers()
            .await
            .get(&State::Unknown)
            .is_some_and(|n| *n > 0);
        let running = self.pool.running().await;
        let (entries, threshold) = self.queue.entries().await;

        for (uuid, ent) in entries {
            let ctr = &ent.container;
            let tracked = running.get(&uuid);
            let is_running = tracked.is_some();
            let exited = tracked.copied().flatten();
            let exited_before_poll = match (exited, threshold) {
                (Some(exited), Some(threshold)) => threshold > exited,
                _ => false,
            };

            match ctr.state {
                ContainerState::Running => {
                    if !is_running {
                        if !any_unknown {
                            self.bg_cancel(&uuid, "not running on any worker");
                        }
                    } else if exited_before_poll {
                        self.bg_cancel(&uuid, "state=Running after supervisor exited");
                    } else if ctr.priority == 0 {
                        self.bg_kill(&uuid, "priority=0".to_string());
                    }
                }
                ContainerState::Complete | ContainerState::Cancelled => {
                    if is_running {
                        self.bg_kill(&uuid, format!("state={}", ctr.state));
                    } else {
                        info!(container_uuid = %uuid, state = %ctr.state, "container finished, dropping from queue");
                        self.queue.forget(&uuid).await;
                    }
                }
                ContainerState::Queued => {
                    if is_running {
                        self.bg_kill(&uuid, "state=Queued".to_string());
                    } else if ctr.priority == 0 {
                        info!(container_uuid = %uuid, "container on hold, dropping from queue");
                        self.queue.forget(&uuid).await;
                    }
                }
                ContainerState::Locked => {
                    if is_running && exited_before_poll {
                        self.bg_unlock(&uuid, "supervisor exited without starting container");
                    } else if is_running && exited.is_none() && ctr.priority == 0 {
                        self.bg_kill(&uuid, "priority=0".to_string());
                    } else if !is_running && ctr.priority == 0 {
                        self.bg_unlock(&uuid, "priority=0");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::super::tests::{FakePool, ctr, settle, setup};
    use crate::container::ContainerState;
    use crate::worker::State;

    #[tokio::test(start_paused = true)]
    async fn test_running_orphan_is_cancelled() {
        let pool = FakePool::loaded();
        let (cp, _queue, sched) =
            setup(vec![ctr("c1", ContainerState::Running, 1, 1)], pool.clone()).await;
        sched.sync().await;
        settle().await;
        assert_eq!(cp.container("c1").await.unwrap().state, ContainerState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_orphan_waits_for_unknown_workers() {
        let pool = FakePool::loaded();
        pool.state.lock().await.workers.insert(State::Unknown, 1);
        let (cp, _queue, sched) =
            setup(vec![ctr("c1", ContainerState::Running, 1, 1)], pool.clone()).await;
        sched.sync().await;
        settle().await;
        assert_eq!(cp.container("c1").await.unwrap().state, ContainerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_is_compared_with_last_poll() {
        let pool = FakePool::loaded();
        let (cp, queue, sched) = setup(
            vec![
                ctr("c-run", ContainerState::Running, 1, 1),
                ctr("c-lock", ContainerState::Locked, 1, 1),
            ],
            pool.clone(),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        {
            let mut state = pool.state.lock().await;
            let exited = Some(Instant::now());
            state.running.insert("c-run".into(), exited);
            state.running.insert("c-lock".into(), exited);
        }

        // Exit happened after the last poll: the queue may be stale.
        sched.sync().await;
        settle().await;
        assert_eq!(cp.container("c-run").await.unwrap().state, ContainerState::Running);
        assert_eq!(cp.container("c-lock").await.unwrap().state, ContainerState::Locked);

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.update().await.unwrap();
        sched.sync().await;
        settle().await;
        assert_eq!(cp.container("c-run").await.unwrap().state, ContainerState::Cancelled);
        assert_eq!(cp.container("c-lock").await.unwrap().state, ContainerState::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_containers_are_killed_or_forgotten() {
        let pool = FakePool::loaded();
        pool.state.lock().await.running.insert("c-done".into(), None);
        let (cp, queue, sched) = setup(
            vec![
                ctr("c-done", ContainerState::Running, 1, 1),
                ctr("c-gone", ContainerState::Running, 1, 1),
            ],
            pool.clone(),
        )
        .await;
        cp.set_state("c-done", ContainerState::Complete).await;
        cp.set_state("c-gone", ContainerState::Cancelled).await;
        queue.update().await.unwrap();

        sched.sync().await;
        settle().await;

        let state = pool.state.lock().await;
        assert_eq!(state.kills, vec![("c-done".to_string(), "state=Complete".to_string())]);
        assert_eq!(state.forgets, vec!["c-done".to_string()]);
        drop(state);
        assert!(queue.get("c-gone").await.is_none());
        assert!(queue.get("c-done").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_zero() {
        let pool = FakePool::loaded();
        pool.state.lock().await.running.insert("c-run".into(), None);
        let (cp, queue, sched) = setup(
            vec![
                ctr("c-run", ContainerState::Running, 1, 1),
                ctr("c-lock", ContainerState::Locked, 1, 1),
            ],
            pool.clone(),
        )
        .await;
        let mut held = cp.container("c-run").await.unwrap();
        held.priority = 0;
        cp.put(held).await;
        let mut held = cp.container("c-lock").await.unwrap();
        held.priority = 0;
        cp.put(held).await;
        queue.update().await.unwrap();

        sched.sync().await;
        settle().await;

        assert_eq!(
            pool.state.lock().await.kills,
            vec![("c-run".to_string(), "priority=0".to_string())]
        );
        assert_eq!(cp.container("c-lock").await.unwrap().state, ContainerState::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_with_supervisor_is_killed() {
        let pool = FakePool::loaded();
        pool.state.lock().await.running.insert("c1".into(), None);
        let (_cp, _queue, sched) =
            setup(vec![ctr("c1", ContainerState::Queued, 1, 1)], pool.clone()).await;
        sched.sync().await;
        settle().await;
        assert_eq!(
            pool.state.lock().await.kills,
            vec![("c1".to_string(), "state=Queued".to_string())]
        );
    }
}
