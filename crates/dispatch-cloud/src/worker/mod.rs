// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool: one worker per cloud instance.
//!
//! The [`Pool`] owns every worker, keyed by instance ID. It keeps the map in
//! step with the instance set (sync loop), probes each worker for boot and
//! running supervisors (probe loop), and creates or destroys instances on
//! the scheduler's request.
//!
//! ```text
//!            create()                 boot probe ok
//!   (none) ───────────► Booting ──────────────────────► Idle ◄──┐
//!      │                   │                             │      │ all exited
//!      │ sync()            │ timeout_booting             │      │
//!      ▼                   ▼                start_container ▼    │
//!   Unknown ───────────► Shutdown ◄─────────────────── Running ──┘
//!            timeout       (terminal)        drain, unkillable
//! ```
//!
//! Idle behavior is orthogonal to the state: `Hold` keeps a worker from
//! being shut down automatically, `Drain` shuts it down as soon as it is
//! idle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod instance_set;
pub mod limiter;
pub mod pool;
mod probe;
pub mod runner;
pub mod throttle;
pub mod verify;

pub use pool::{Pool, PoolConfig, PoolError};

/// Reserved tag key suffixes. The pool prepends its configured prefix.
pub mod tag_keys {
    /// Instance type name.
    pub const INSTANCE_TYPE: &str = "InstanceType";
    /// Instance set ID of the dispatcher that owns the instance.
    pub const INSTANCE_SET_ID: &str = "InstanceSetID";
    /// Random secret used to verify the instance's host key.
    pub const INSTANCE_SECRET: &str = "InstanceSecret";
    /// Persisted idle behavior.
    pub const IDLE_BEHAVIOR: &str = "IdleBehavior";
    /// Legacy hold marker: any non-empty value means `Hold`.
    pub const HOLD: &str = "Hold";
    /// PID of a cloud test harness that created the instance.
    pub const CLOUD_TEST_PID: &str = "CloudTestPID";
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Seen in the instance list without a local create.
    Unknown,
    /// Created by this pool; boot probe has not passed yet.
    Booting,
    /// Booted with no supervisors.
    Idle,
    /// At least one supervisor is starting or running.
    Running,
    /// Being destroyed. Terminal.
    Shutdown,
}

impl State {
    /// Lowercase name used in logs and the management surface.
    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "unknown",
            State::Booting => "booting",
            State::Idle => "idle",
            State::Running => "running",
            State::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker should do when it has no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleBehavior {
    /// Accept containers; shut down after the idle timeout.
    #[default]
    Run,
    /// Accept no new containers; never shut down automatically.
    Hold,
    /// Accept no new containers; shut down as soon as idle.
    Drain,
}

impl IdleBehavior {
    /// Tag value for this behavior.
    pub fn as_str(self) -> &'static str {
        match self {
            IdleBehavior::Run => "run",
            IdleBehavior::Hold => "hold",
            IdleBehavior::Drain => "drain",
        }
    }

    /// Parse a tag value. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run" => Some(IdleBehavior::Run),
            "hold" => Some(IdleBehavior::Hold),
            "drain" => Some(IdleBehavior::Drain),
            _ => None,
        }
    }
}

impl fmt::Display for IdleBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one worker for the management surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    /// Cloud instance ID.
    pub instance: String,
    /// Address, if known.
    pub address: String,
    /// Worker state.
    pub worker_state: State,
    /// Idle behavior.
    pub idle_behavior: IdleBehavior,
    /// Configured instance type name.
    pub arvados_instance_type: String,
    /// Provider instance type.
    pub provider_instance_type: String,
    /// Hourly price.
    pub price: f64,
    /// Most recent container seen on this worker.
    pub last_container_uuid: String,
    /// Last time the worker was observed busy.
    pub last_busy: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_behavior_tag_values() {
        for b in [IdleBehavior::Run, IdleBehavior::Hold, IdleBehavior::Drain] {
            assert_eq!(IdleBehavior::parse(b.as_str()), Some(b));
        }
        assert_eq!(IdleBehavior::parse("sleep"), None);
        assert_eq!(IdleBehavior::parse(""), None);
    }

    #[test]
    fn test_instance_view_serialization() {
        let view = InstanceView {
            instance: "i-1".into(),
            address: "10.0.0.1".into(),
            worker_state: State::Idle,
            idle_behavior: IdleBehavior::Hold,
            arvados_instance_type: "small".into(),
            provider_instance_type: "p-small".into(),
            price: 0.25,
            last_container_uuid: String::new(),
            last_busy: DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default(),
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["worker_state"], "idle");
        assert_eq!(json["idle_behavior"], "hold");
        assert_eq!(json["arvados_instance_type"], "small");
    }
}
