// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handle for one supervisor process on a worker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::executor::{Executor, ExecutorError};

/// SIGTERM. The supervisor is never sent SIGKILL: killing it would orphan
/// the container's processes.
pub const SIGTERM: i32 = 15;

/// Callbacks from a runner's kill loop.
#[async_trait]
pub trait RunnerHooks: Send + Sync {
    /// The supervisor for `uuid` accepted the signal and exited.
    async fn on_killed(&self, uuid: &str);

    /// The supervisor for `uuid` survived signals for the whole TERM timeout.
    async fn on_unkillable(&self, uuid: &str);
}

/// Settings shared by every runner of a pool.
#[derive(Clone)]
pub struct RunnerSettings {
    /// Supervisor command, already prefixed with `sudo` if needed.
    pub command: String,
    /// Environment passed to the supervisor as JSON on stdin.
    pub env: BTreeMap<String, String>,
    /// Interval between kill attempts.
    pub timeout_signal: Duration,
    /// Give up killing after this long.
    pub timeout_term: Duration,
}

/// One supervisor, started by this process or adopted from a probe.
pub struct RemoteRunner {
    uuid: String,
    executor: Arc<dyn Executor>,
    settings: RunnerSettings,
    hooks: Arc<dyn RunnerHooks>,
    stopping: AtomicBool,
    given_up: AtomicBool,
    closed: watch::Sender<bool>,
}

fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

impl RemoteRunner {
    /// Create a handle for the supervisor of `uuid`.
    pub fn new(
        uuid: &str,
        executor: Arc<dyn Executor>,
        settings: RunnerSettings,
        hooks: Arc<dyn RunnerHooks>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            uuid: uuid.to_string(),
            executor,
            settings,
            hooks,
            stopping: AtomicBool::new(false),
            given_up: AtomicBool::new(false),
            closed,
        }
    }

    /// Container UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Whether the kill loop has given up.
    pub fn given_up(&self) -> bool {
        self.given_up.load(Ordering::SeqCst)
    }

    /// Whether a kill has been requested.
    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Launch the supervisor in the background.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        let env = serde_json::to_vec(&self.settings.env)
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;
        let cmd = format!(
            "{} --detach --stdin-env {}",
            self.settings.command,
            quote(&self.uuid)
        );
        match self.executor.execute(&BTreeMap::new(), &cmd, Some(env)).await {
            Ok(_) => {
                info!(container_uuid = %self.uuid, "supervisor process started");
                Ok(())
            }
            Err(err) => {
                warn!(container_uuid = %self.uuid, error = %err, "error starting supervisor process");
                Err(err)
            }
        }
    }

    /// Send SIGTERM every `timeout_signal` until it exits or `timeout_term`
    /// passes. Only the first call starts a kill loop.
    pub fn kill(self: &Arc<Self>, reason: &str) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(container_uuid = %self.uuid, reason, "killing supervisor process");
        let rr = self.clone();
        tokio::spawn(async move { rr.kill_loop().await });
    }

    async fn kill_loop(&self) {
        let deadline = Instant::now() + self.settings.timeout_term;
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow() {
                return;
            }
            if Instant::now() >= deadline {
                debug!(container_uuid = %self.uuid, "giving up on kill");
                self.given_up.store(true, Ordering::SeqCst);
                self.hooks.on_unkillable(&self.uuid).await;
                return;
            }
            if self.signal(SIGTERM).await {
                self.hooks.on_killed(&self.uuid).await;
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.timeout_signal) => {}
                _ = closed.wait_for(|c| *c) => return,
            }
        }
    }

    async fn signal(&self, signal: i32) -> bool {
        let cmd = format!(
            "{} --kill {} {}",
            self.settings.command,
            signal,
            quote(&self.uuid)
        );
        match self.executor.execute(&BTreeMap::new(), &cmd, None).await {
            Ok(_) => {
                debug!(container_uuid = %self.uuid, signal, "supervisor exited after signal");
                true
            }
            Err(err) => {
                debug!(container_uuid = %self.uuid, signal, error = %err, "kill attempt failed");
                false
            }
        }
    }

    /// Stop any kill loop. The supervisor has exited or been abandoned.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}
