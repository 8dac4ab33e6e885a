// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable dispatcher runtime.
//!
//! [`DispatcherRuntime`] wires a driver and a control plane into a running
//! dispatcher: the decorated instance set, the container queue, the worker
//! pool, the scheduler and, when an address is configured, the management
//! API.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dispatch_cloud::config::Config;
//! use dispatch_cloud::container::HttpControlPlane;
//! use dispatch_cloud::runtime::DispatcherRuntime;
//! use dispatch_cloud_driver::stub::StubDriver;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let api = Arc::new(HttpControlPlane::new(&config.api_host, &config.api_token)?);
//!
//!     let runtime = DispatcherRuntime::builder()
//!         .config(config)
//!         .driver(Arc::new(StubDriver::default()))
//!         .control_plane(api)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dispatch_cloud_driver::{Driver, InstanceSet, InstanceSetId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::container::{ControlPlane, Queue, QueueConfig};
use crate::executor::ExecutorFactory;
use crate::executor::ssh::SshExecutor;
use crate::management::{self, ManagementState, RequestTracker};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::worker::instance_set::{RateLimitedInstanceSet, TaggedInstanceSet};
use crate::worker::{Pool, PoolConfig};

/// Builder for a [`DispatcherRuntime`].
#[derive(Default)]
pub struct DispatcherRuntimeBuilder {
    config: Option<Config>,
    driver: Option<Arc<dyn Driver>>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    executor_factory: Option<ExecutorFactory>,
}

impl DispatcherRuntimeBuilder {
    /// Create a builder with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dispatcher configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the cloud driver (required).
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the control plane client (required).
    pub fn control_plane(mut self, api: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(api);
        self
    }

    /// Set how executors are built for new instances.
    ///
    /// Default: SSH with the configured private key.
    pub fn executor_factory(mut self, factory: ExecutorFactory) -> Self {
        self.executor_factory = Some(factory);
        self
    }

    /// Check that every required part is present.
    pub fn build(self) -> Result<DispatcherRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("driver is required"))?;
        let control_plane = self
            .control_plane
            .ok_or_else(|| anyhow::anyhow!("control_plane is required"))?;

        let executor_factory = match self.executor_factory {
            Some(factory) => factory,
            None => {
                let key = config
                    .ssh_private_key
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("an SSH private key is required"))?;
                SshExecutor::factory(key, config.ssh_port)
            }
        };

        Ok(DispatcherRuntimeConfig {
            config,
            driver,
            control_plane,
            executor_factory,
        })
    }
}

/// Everything needed to start a [`DispatcherRuntime`].
pub struct DispatcherRuntimeConfig {
    config: Config,
    driver: Arc<dyn Driver>,
    control_plane: Arc<dyn ControlPlane>,
    executor_factory: ExecutorFactory,
}

impl DispatcherRuntimeConfig {
    fn pool_config(&self) -> PoolConfig {
        let config = &self.config;
        let public_key = config.ssh_public_key_path.as_ref().and_then(|path| {
            match std::fs::read_to_string(path) {
                Ok(key) => Some(key.trim().to_string()),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read SSH public key, instances get none");
                    None
                }
            }
        });
        PoolConfig {
            image_id: config.image_id.clone(),
            public_key,
            tag_key_prefix: config.tag_key_prefix.clone(),
            supervisor_command: config.supervisor_command.clone(),
            supervisor_env: BTreeMap::from([
                ("API_HOST".to_string(), config.api_host.clone()),
                ("API_TOKEN".to_string(), config.api_token.clone()),
            ]),
            boot_probe_command: config.boot_probe_command.clone(),
            cluster_id: config.cluster_id.clone(),
            sync_interval: config.sync_interval,
            probe_interval: config.probe_interval,
            max_probes_per_second: config.max_probes_per_second,
            timeouts: config.timeouts.clone(),
        }
    }

    /// Build every component and spawn the background tasks.
    pub async fn start(self) -> Result<DispatcherRuntime> {
        let config = &self.config;
        let instance_set_id = config.instance_set_id();
        info!(
            driver = self.driver.name(),
            instance_set_id = %instance_set_id,
            "starting dispatcher"
        );

        let raw = self
            .driver
            .instance_set(&config.driver_parameters, &instance_set_id, &config.resource_tags)
            .await
            .context("creating instance set")?;
        let limited: Arc<dyn InstanceSet> = Arc::new(RateLimitedInstanceSet::new(
            raw,
            config.max_cloud_ops_per_second,
        ));
        let instance_set: Arc<dyn InstanceSet> =
            Arc::new(TaggedInstanceSet::new(limited, config.resource_tags.clone()));

        let queue = Arc::new(Queue::new(
            self.control_plane.clone(),
            config.instance_types.clone(),
            QueueConfig::default(),
        ));

        let pool = Pool::new(
            self.pool_config(),
            instance_set.clone(),
            instance_set_id.clone(),
            config.instance_types.clone(),
            self.executor_factory.clone(),
        );
        let pool_handle = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run().await }
        });

        let scheduler = Scheduler::new(
            queue.clone(),
            Arc::new(pool.clone()),
            SchedulerConfig {
                poll_interval: config.poll_interval,
                stale_lock_timeout: config.stale_lock_timeout,
            },
        );
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

        let management_shutdown = Arc::new(Notify::new());
        let management_handle = config.management_addr.map(|addr| {
            let state = ManagementState {
                queue: queue.clone(),
                pool: pool.clone(),
                token: config.management_token.clone(),
                requests: RequestTracker::new(),
            };
            tokio::spawn(management::serve(addr, state, management_shutdown.clone()))
        });

        info!(
            instance_set_id = %instance_set_id,
            management_addr = ?config.management_addr,
            "DispatcherRuntime started"
        );

        Ok(DispatcherRuntime {
            instance_set_id,
            management_addr: config.management_addr,
            queue,
            pool,
            instance_set,
            pool_handle,
            scheduler_handle,
            scheduler_shutdown,
            management_handle,
            management_shutdown,
        })
    }
}

/// A running dispatcher.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination. Cloud
/// instances are left running so the next dispatcher can adopt them.
pub struct DispatcherRuntime {
    instance_set_id: InstanceSetId,
    management_addr: Option<SocketAddr>,
    queue: Arc<Queue>,
    pool: Pool,
    instance_set: Arc<dyn InstanceSet>,
    pool_handle: JoinHandle<()>,
    scheduler_handle: JoinHandle<()>,
    scheduler_shutdown: Arc<Notify>,
    management_handle: Option<JoinHandle<std::io::Result<()>>>,
    management_shutdown: Arc<Notify>,
}

impl DispatcherRuntime {
    /// Create a new builder.
    pub fn builder() -> DispatcherRuntimeBuilder {
        DispatcherRuntimeBuilder::new()
    }

    /// The instance set ID derived from the API token.
    pub fn instance_set_id(&self) -> &InstanceSetId {
        &self.instance_set_id
    }

    /// Configured management API address, if any.
    pub fn management_addr(&self) -> Option<SocketAddr> {
        self.management_addr
    }

    /// The container queue.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// The worker pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Whether every background task is still running.
    pub fn is_running(&self) -> bool {
        !self.pool_handle.is_finished()
            && !self.scheduler_handle.is_finished()
            && self
                .management_handle
                .as_ref()
                .is_none_or(|h| !h.is_finished())
    }

    /// Stop the scheduler, the pool, the management API and finally the
    /// instance set, waiting for each.
    pub async fn shutdown(self) -> Result<()> {
        info!("DispatcherRuntime shutting down...");

        self.scheduler_shutdown.notify_one();
        if let Err(e) = self.scheduler_handle.await {
            error!("Scheduler task panicked: {}", e);
        }

        self.pool.stop().await;
        if let Err(e) = self.pool_handle.await {
            error!("Worker pool task panicked: {}", e);
        }

        let mut result = Ok(());
        if let Some(handle) = self.management_handle {
            self.management_shutdown.notify_one();
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Management API error during shutdown: {}", e);
                    result = Err(anyhow::Error::from(e));
                }
                Err(e) => {
                    error!("Management API task panicked: {}", e);
                    result = Err(anyhow::anyhow!("management task panicked: {}", e));
                }
            }
        }

        self.instance_set.stop().await;
        info!("DispatcherRuntime shutdown complete");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::stub::StubControlPlane;
    use crate::executor::stub::StubExecutor;
    use dispatch_cloud_driver::stub::{StubDriver, StubDriverConfig};

    fn config() -> Config {
        Config::from_lookup(|name| match name {
            "DISPATCH_CLOUD_API_HOST" => Some("api.example".into()),
            "DISPATCH_CLOUD_API_TOKEN" => Some("v2/zzzzz-gj3su-000000000000000/secret".into()),
            "DISPATCH_CLOUD_INSTANCE_TYPES" => Some(
                r#"[{"name": "small", "provider_type": "p-small", "vcpus": 2, "ram": 4294967296, "price": 0.1}]"#
                    .into(),
            ),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_build_requires_parts() {
        let err = DispatcherRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("config is required"));

        let err = DispatcherRuntime::builder()
            .config(config())
            .driver(Arc::new(StubDriver::default()))
            .control_plane(Arc::new(StubControlPlane::default()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("SSH private key"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_and_shutdown() {
        let driver = StubDriver::new(StubDriverConfig::default());
        let runtime = DispatcherRuntime::builder()
            .config(config())
            .driver(Arc::new(driver.clone()))
            .control_plane(Arc::new(StubControlPlane::default()))
            .executor_factory(StubExecutor::driver_factory(driver.clone()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(runtime.instance_set_id().as_str(), "zzzzz-gj3su-000000000000000");
        assert!(runtime.is_running());

        let sets = driver.instance_sets().await;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].set_id().as_str(), "zzzzz-gj3su-000000000000000");

        runtime.shutdown().await.unwrap();
        assert!(sets[0].is_stopped().await);
    }
}
