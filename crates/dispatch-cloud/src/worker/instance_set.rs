// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance set decorators applied by the runtime.

use std::sync::Arc;

use async_trait::async_trait;
use dispatch_cloud_driver::{
    CloudError, ImageId, InitCommand, Instance, InstanceSet, InstanceTags, InstanceType,
};

use super::limiter::RateLimiter;

/// Limits `create` and `instances` calls to a fixed rate.
pub struct RateLimitedInstanceSet {
    inner: Arc<dyn InstanceSet>,
    limiter: RateLimiter,
}

impl RateLimitedInstanceSet {
    /// Wrap `inner`, allowing `ops_per_second` calls (0 = unlimited).
    pub fn new(inner: Arc<dyn InstanceSet>, ops_per_second: u32) -> Self {
        Self {
            inner,
            limiter: RateLimiter::per_second(ops_per_second),
        }
    }
}

#[async_trait]
impl InstanceSet for RateLimitedInstanceSet {
    async fn create(
        &self,
        instance_type: &InstanceType,
        image_id: &ImageId,
        tags: InstanceTags,
        init_command: InitCommand,
        public_key: Option<&str>,
    ) -> Result<Arc<dyn Instance>, CloudError> {
        self.limiter.wait().await;
        self.inner
            .create(instance_type, image_id, tags, init_command, public_key)
            .await
    }

    async fn instances(&self, filter: &InstanceTags) -> Result<Vec<Arc<dyn Instance>>, CloudError> {
        self.limiter.wait().await;
        self.inner.instances(filter).await
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }
}

/// Adds default resource tags to every created instance.
///
/// Tags passed to `create` win over the defaults.
pub struct TaggedInstanceSet {
    inner: Arc<dyn InstanceSet>,
    default_tags: InstanceTags,
}

impl TaggedInstanceSet {
    /// Wrap `inner`, adding `default_tags` on create.
    pub fn new(inner: Arc<dyn InstanceSet>, default_tags: InstanceTags) -> Self {
        Self {
            inner,
            default_tags,
        }
    }
}

#[async_trait]
impl InstanceSet for TaggedInstanceSet {
    async fn create(
        &self,
        instance_type: &InstanceType,
        image_id: &ImageId,
        tags: InstanceTags,
        init_command: InitCommand,
        public_key: Option<&str>,
    ) -> Result<Arc<dyn Instance>, CloudError> {
        let mut all = self.default_tags.clone();
        all.extend(tags);
        self.inner
            .create(instance_type, image_id, all, init_command, public_key)
            .await
    }

    async fn instances(&self, filter: &InstanceTags) -> Result<Vec<Arc<dyn Instance>>, CloudError> {
        self.inner.instances(filter).await
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_cloud_driver::InstanceSetId;
    use dispatch_cloud_driver::stub::{StubDriverConfig, StubInstanceSet};
    use std::time::Duration;
    use tokio::time::Instant;

    fn small() -> InstanceType {
        InstanceType {
            name: "small".into(),
            provider_type: "p-small".into(),
            vcpus: 1,
            ram: 1 << 30,
            scratch: 0,
            price: 0.1,
            preemptible: false,
        }
    }

    fn stub() -> StubInstanceSet {
        StubInstanceSet::new(
            StubDriverConfig::default(),
            InstanceSetId::from("set"),
            InstanceTags::new(),
        )
    }

    #[tokio::test]
    async fn test_default_tags_do_not_override() {
        let set = stub();
        let defaults = InstanceTags::from([
            ("owner".to_string(), "ops".to_string()),
            ("env".to_string(), "prod".to_string()),
        ]);
        let tagged = TaggedInstanceSet::new(Arc::new(set.clone()), defaults);
        let tags = InstanceTags::from([("env".to_string(), "test".to_string())]);
        let inst = tagged
            .create(&small(), &ImageId::default(), tags, InitCommand::default(), None)
            .await
            .unwrap();
        let got = set.tags_of(&inst.id()).await.unwrap();
        assert_eq!(got.get("owner").map(String::as_str), Some("ops"));
        assert_eq!(got.get("env").map(String::as_str), Some("test"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_calls_are_spaced() {
        let set = stub();
        let limited = RateLimitedInstanceSet::new(Arc::new(set.clone()), 4);
        let start = Instant::now();
        for _ in 0..3 {
            limited.instances(&InstanceTags::new()).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(set.instances_calls().await, 3);
    }
}
