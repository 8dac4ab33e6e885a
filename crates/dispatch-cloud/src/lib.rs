// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch Cloud - Cloud VM Dispatcher
//!
//! This crate runs queued containers on cloud VMs. It mirrors the control
//! plane's container queue, keeps one worker per cloud instance, and maps
//! containers onto workers in priority order, creating and destroying
//! instances as demand changes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Control Plane API                              │
//! │                  (container records, lock/unlock, cancel)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    ▲
//!                                    │ poll / mutate
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      dispatch-cloud (This Crate)                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Container  │◄─│  Scheduler  │─►│   Worker    │─►│  Executor   │     │
//! │  │    Queue    │  │             │  │    Pool     │  │  (SSH)      │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                              │ create / list / destroy
//!                                              ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Cloud Driver (dispatch-cloud-driver)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   Queued ──lock──► Locked ──start──► Running ──► Complete
//!     ▲                │                  │
//!     └────unlock──────┘                  └──cancel──► Cancelled
//! ```
//!
//! The control plane moves a container to Running and to its final state;
//! this dispatcher only locks, unlocks and cancels.
//!
//! # Management API
//!
//! | Route | Description |
//! |-------|-------------|
//! | `GET /arvados/v1/dispatch/containers` | Queue entries |
//! | `GET /arvados/v1/dispatch/container` | One queue entry |
//! | `POST /arvados/v1/dispatch/containers/kill` | Kill a supervisor |
//! | `GET /arvados/v1/dispatch/instances` | Workers |
//! | `POST /arvados/v1/dispatch/instances/{hold,drain,run}` | Set idle behavior |
//! | `POST /arvados/v1/dispatch/instances/kill` | Shut down a worker |
//! | `GET /_health/ping` | Liveness |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables prefixed with
//! `DISPATCH_CLOUD_`:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `API_HOST` | Yes | - | Control plane base URL |
//! | `API_TOKEN` | Yes | - | Bearer token; also seeds the instance set ID |
//! | `INSTANCE_TYPES` | Yes | - | JSON list of instance types |
//! | `DRIVER` | No | `stub` | Cloud driver |
//! | `DRIVER_PARAMETERS` | No | `{}` | Opaque driver JSON |
//! | `IMAGE_ID` | No | - | Image for new instances |
//! | `SSH_PRIVATE_KEY_PATH` | Yes** | - | Key for the SSH executor |
//! | `SSH_PUBLIC_KEY_PATH` | No | `<private>.pub` | Key installed on new instances |
//! | `SSH_PORT` | No | `22` | Default SSH port |
//! | `SUPERVISOR_COMMAND` | No | `dispatch-supervisor` | Remote supervisor |
//! | `BOOT_PROBE_COMMAND` | No | `true` | Boot readiness check |
//! | `TAG_KEY_PREFIX` | No | `dispatch-` | Prefix for reserved tag keys |
//! | `RESOURCE_TAGS` | No | `{}` | Tags added to every instance |
//! | `CLUSTER_ID` | No | - | Filters `--list` output |
//! | `MANAGEMENT_ADDR` | No | - | Management API bind address |
//! | `MANAGEMENT_TOKEN` | No | - | Management API bearer token |
//! | `POLL_INTERVAL_SECS` | No | `1` | Queue poll and scheduling interval |
//! | `SYNC_INTERVAL_SECS` | No | `60` | Instance list interval |
//! | `PROBE_INTERVAL_SECS` | No | `10` | Worker probe interval |
//! | `MAX_PROBES_PER_SECOND` | No | `10` | Probe rate limit |
//! | `MAX_CLOUD_OPS_PER_SECOND` | No | `0` | Cloud API rate limit (0 = none) |
//! | `STALE_LOCK_TIMEOUT_SECS` | No | `60` | Startup wait before unlocking stale locks |
//! | `TIMEOUT_*_SECS` | No | see [`config::Timeouts`] | Worker timeouts |
//!
//! \*\* Not required with the stub driver.
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`container`]: Container records and the queue mirror
//! - [`error`]: Error types
//! - [`executor`]: Remote command execution (SSH and stub)
//! - [`management`]: Management HTTP API
//! - [`notify`]: Coalescing change notifications
//! - [`runtime`]: Embeddable runtime wiring everything together
//! - [`scheduler`]: Run queue and reconciliation
//! - [`worker`]: Worker pool, probes and supervisor handles

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Container records and the local queue mirror.
pub mod container;

/// Error types.
pub mod error;

/// Remote command execution.
pub mod executor;

/// Management HTTP API.
pub mod management;

/// Coalescing change notifications.
pub mod notify;

/// Embeddable runtime.
pub mod runtime;

/// Scheduling of containers onto workers.
pub mod scheduler;

/// Worker pool.
pub mod worker;

pub use error::{Error, Result};
