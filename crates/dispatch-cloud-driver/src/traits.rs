// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Driver, instance set and instance traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CloudError;
use crate::types::{ImageId, InitCommand, InstanceId, InstanceSetId, InstanceTags, InstanceType};

/// Runs a command over a connection whose host key is not yet trusted.
///
/// Handed to [`ExecutorTarget::verify_host_key`] so an implementation can
/// inspect the remote host before the executor pins its key.
#[async_trait]
pub trait HostKeyChallenge: Send + Sync {
    /// Run `command` on the remote host and return its stdout.
    async fn run(&self, command: &str) -> Result<Vec<u8>, CloudError>;
}

/// Everything a remote executor needs to reach an instance.
#[async_trait]
pub trait ExecutorTarget: Send + Sync {
    /// Host or `host:port` to connect to, if the instance has one yet.
    fn address(&self) -> Option<String>;

    /// Login user on the instance.
    fn remote_user(&self) -> String;

    /// Decide whether `host_key` really belongs to this instance.
    ///
    /// Called once per executor for the first key received; the key is
    /// pinned on success. The default refuses with
    /// [`CloudError::NotImplemented`].
    async fn verify_host_key(
        &self,
        host_key: &[u8],
        challenge: &dyn HostKeyChallenge,
    ) -> Result<(), CloudError> {
        let _ = (host_key, challenge);
        Err(CloudError::NotImplemented)
    }
}

/// A cloud VM handle.
#[async_trait]
pub trait Instance: ExecutorTarget + fmt::Display {
    /// Provider-assigned identifier.
    fn id(&self) -> InstanceId;

    /// Provider's name for the instance size.
    fn provider_type(&self) -> String;

    /// Tags as of when this handle was obtained.
    fn tags(&self) -> InstanceTags;

    /// Replace the instance's tags.
    async fn set_tags(&self, tags: InstanceTags) -> Result<(), CloudError>;

    /// Destroy the instance.
    async fn destroy(&self) -> Result<(), CloudError>;
}

/// The create/list surface for instances owned by one dispatcher.
#[async_trait]
pub trait InstanceSet: Send + Sync {
    /// Create a new instance.
    ///
    /// `init_command` runs on first boot; `public_key`, when given, is
    /// installed for the remote user.
    async fn create(
        &self,
        instance_type: &InstanceType,
        image_id: &ImageId,
        tags: InstanceTags,
        init_command: InitCommand,
        public_key: Option<&str>,
    ) -> Result<Arc<dyn Instance>, CloudError>;

    /// List instances whose tags include every entry of `filter_tags`.
    async fn instances(&self, filter_tags: &InstanceTags)
    -> Result<Vec<Arc<dyn Instance>>, CloudError>;

    /// Release resources held by the instance set. Instances keep running.
    async fn stop(&self);
}

/// Factory for instance sets.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver name used in configuration.
    fn name(&self) -> &'static str;

    /// Build an instance set for `set_id`.
    ///
    /// `config` is opaque driver configuration; `shared_tags` should be
    /// applied to every long-lived resource the set creates.
    async fn instance_set(
        &self,
        config: &serde_json::Value,
        set_id: &InstanceSetId,
        shared_tags: &InstanceTags,
    ) -> Result<Arc<dyn InstanceSet>, CloudError>;
}
