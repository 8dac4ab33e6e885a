// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container records and the local queue mirror.
//!
//! The control plane owns container records. This module keeps a cached,
//! locally mutable copy of the containers this dispatcher may run
//! ([`queue::Queue`]) and assigns each one an instance type on first sight
//! ([`chooser::choose_instance_type`]).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use dispatch_cloud_driver::InstanceType;
use serde::{Deserialize, Serialize};

pub mod api;
pub mod chooser;
pub mod queue;
pub mod stub;

pub use api::{ApiError, ControlPlane, HttpControlPlane};
pub use queue::{Queue, QueueConfig};

/// Container state as reported by the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContainerState {
    /// Waiting for a dispatcher.
    #[default]
    Queued,
    /// Claimed by a dispatcher but not started.
    Locked,
    /// Supervisor is running.
    Running,
    /// Finished.
    Complete,
    /// Cancelled.
    Cancelled,
}

impl ContainerState {
    /// Whether the container can no longer change state.
    pub fn is_final(self) -> bool {
        matches!(self, ContainerState::Complete | ContainerState::Cancelled)
    }

    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerState::Queued => "Queued",
            ContainerState::Locked => "Locked",
            ContainerState::Running => "Running",
            ContainerState::Complete => "Complete",
            ContainerState::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources a container needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConstraints {
    /// Virtual CPUs.
    pub vcpus: i64,
    /// Memory in bytes.
    pub ram: i64,
    /// Memory reserved for the data cache, in bytes.
    pub keep_cache_ram: i64,
}

/// A container mount point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    /// Mount kind; `tmp` mounts need scratch disk.
    pub kind: String,
    /// Size in bytes for `tmp` mounts.
    pub capacity: i64,
}

/// Scheduling hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingParameters {
    /// Container may run on a preemptible instance.
    pub preemptible: bool,
}

/// The fields of a container record the dispatcher uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    /// Container UUID.
    pub uuid: String,
    /// Current state.
    pub state: ContainerState,
    /// Priority; zero or less means "do not run".
    pub priority: i64,
    /// Token UUID of the dispatcher holding the lock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by_uuid: Option<String>,
    /// Resource needs.
    pub runtime_constraints: RuntimeConstraints,
    /// Image reference.
    pub container_image: String,
    /// Mount points keyed by path.
    pub mounts: BTreeMap<String, Mount>,
    /// Scheduling hints.
    pub scheduling_parameters: SchedulingParameters,
    /// Creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A queue entry: a container and the instance type chosen to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEnt {
    /// The container.
    pub container: Container,
    /// Instance type assigned when the entry was added.
    pub instance_type: InstanceType,
    /// When the entry was first seen by this process.
    pub first_seen_at: DateTime<Utc>,
}

impl fmt::Display for QueueEnt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.container.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_deserialize_partial_record() {
        let c: Container = serde_json::from_str(
            r#"{
                "uuid": "zzzzz-dz642-000000000000001",
                "state": "Locked",
                "priority": 3,
                "runtime_constraints": {"vcpus": 2, "ram": 1073741824},
                "mounts": {"/tmp": {"kind": "tmp", "capacity": 1000}},
                "scheduling_parameters": {"preemptible": true}
            }"#,
        )
        .unwrap();
        assert_eq!(c.state, ContainerState::Locked);
        assert_eq!(c.runtime_constraints.keep_cache_ram, 0);
        assert_eq!(c.mounts["/tmp"].capacity, 1000);
        assert!(c.scheduling_parameters.preemptible);
        assert!(c.locked_by_uuid.is_none());
    }

    #[test]
    fn test_final_states() {
        assert!(ContainerState::Complete.is_final());
        assert!(ContainerState::Cancelled.is_final());
        assert!(!ContainerState::Running.is_final());
        assert_eq!(ContainerState::Queued.to_string(), "Queued");
    }
}
