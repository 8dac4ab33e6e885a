// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for dispatch-cloud.

use thiserror::Error;

/// Dispatcher errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Control plane request failed.
    #[error("Control plane error: {0}")]
    Api(#[from] crate::container::api::ApiError),

    /// Cloud provider call failed.
    #[error("Cloud error: {0}")]
    Cloud(#[from] dispatch_cloud_driver::CloudError),

    /// Remote command failed.
    #[error("Executor error: {0}")]
    Executor(#[from] crate::executor::ExecutorError),

    /// No instance type fits a container.
    #[error("Instance type error: {0}")]
    Choose(#[from] crate::container::chooser::ChooseError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Container is not in the queue.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Worker pool refused an operation.
    #[error("Worker pool error: {0}")]
    Pool(#[from] crate::worker::PoolError),
}

/// Result type using dispatcher Error.
pub type Result<T> = std::result::Result<T, Error>;
