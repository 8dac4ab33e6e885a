// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch Cloud Driver - Cloud Provider Contract
//!
//! This crate defines the driver-agnostic interface the dispatcher uses to
//! talk to a cloud provider. A driver hands out an [`InstanceSet`], which owns
//! the create/list/destroy surface for every VM tagged with one dispatcher's
//! [`InstanceSetId`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      dispatch-cloud                           │
//! │        (worker pool, scheduler, remote executor)              │
//! └──────────────────────────────────────────────────────────────┘
//!              │ Create / Instances            │ SetTags / Destroy
//!              ▼                               ▼
//! ┌──────────────────────────┐     ┌──────────────────────────────┐
//! │       InstanceSet        │────►│          Instance            │
//! │  (one per dispatcher ID) │     │  id, tags, address, user,    │
//! └──────────────────────────┘     │  verify_host_key             │
//!              ▲                   └──────────────────────────────┘
//!              │ instance_set(config, set_id, shared_tags)
//! ┌──────────────────────────┐
//! │          Driver          │
//! │   (stub, ec2, azure...)  │
//! └──────────────────────────┘
//! ```
//!
//! # Error Shapes
//!
//! Two provider failures change dispatcher behavior and are recognized by
//! shape rather than by driver:
//!
//! | Shape | Probe | Dispatcher reaction |
//! |-------|-------|---------------------|
//! | Rate limit | [`CloudError::earliest_retry`] | Throttle the API surface until the returned time |
//! | Quota | [`CloudError::is_quota_error`] | Stop creating instances for one minute |
//!
//! # Stub Driver
//!
//! [`stub::StubDriver`] keeps VMs in memory and emulates the remote
//! supervisor CLI, so the whole dispatcher can be exercised without a cloud
//! account.

#![deny(missing_docs)]

/// Cloud provider error shapes.
pub mod error;

/// Driver, instance set and instance traits.
pub mod traits;

/// Identifiers, tags and instance types.
pub mod types;

/// In-memory driver for tests and local development.
pub mod stub;

pub use error::CloudError;
pub use traits::{Driver, ExecutorTarget, HostKeyChallenge, Instance, InstanceSet};
pub use types::{ImageId, InitCommand, InstanceId, InstanceSetId, InstanceTags, InstanceType};
