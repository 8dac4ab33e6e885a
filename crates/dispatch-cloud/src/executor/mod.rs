// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote command execution on worker instances.
//!
//! Each worker owns one [`Executor`]. The pool uses it to run boot probes and
//! to list and kill supervisors; the scheduler uses it, through the pool, to
//! launch them.
//!
//! | Executor | Transport |
//! |----------|-----------|
//! | [`ssh::SshExecutor`] | Long-lived SSH session, one channel per command |
//! | [`stub::StubExecutor`] | In-memory VMs from the stub driver |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dispatch_cloud_driver::{CloudError, ExecutorTarget, Instance};
use thiserror::Error;

pub mod ssh;
pub mod stub;

pub use ssh::{SshExecutor, SshKey};
pub use stub::StubExecutor;

/// Remote execution errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The command ran and exited non-zero.
    #[error("command exited {code}: {}", String::from_utf8_lossy(.stderr).trim())]
    ExitStatus {
        /// Exit code.
        code: i32,
        /// Captured stdout.
        stdout: Vec<u8>,
        /// Captured stderr.
        stderr: Vec<u8>,
    },

    /// The target has no address yet.
    #[error("instance has no address")]
    NoAddress,

    /// Connecting or running the command failed at the transport level.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote host key was rejected.
    #[error("host key verification failed: {0}")]
    HostKey(String),

    /// The executor has been closed.
    #[error("executor is closed")]
    Closed,
}

impl ExecutorError {
    /// Exit code of a command that ran, if it did.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutorError::ExitStatus { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn host_key(err: CloudError) -> Self {
        ExecutorError::HostKey(err.to_string())
    }
}

/// Output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
}

/// Runs shell commands on one remote instance.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `command` with `env` set, feeding `stdin` if given.
    async fn execute(
        &self,
        env: &BTreeMap<String, String>,
        command: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, ExecutorError>;

    /// Point the executor at a new target (e.g. an updated instance handle).
    ///
    /// A working connection to the same address is kept.
    async fn set_target(&self, target: Arc<dyn ExecutorTarget>);

    /// Close the connection and cancel any connection setup in progress.
    async fn close(&self);
}

/// Builds an executor for a newly seen instance.
pub type ExecutorFactory = Arc<dyn Fn(&Arc<dyn Instance>) -> Arc<dyn Executor> + Send + Sync>;
