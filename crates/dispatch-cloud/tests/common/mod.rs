// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for dispatcher E2E tests.
//!
//! Provides TestContext, which runs a full dispatcher against the in-memory
//! control plane and the stub cloud driver.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use dispatch_cloud::config::Config;
use dispatch_cloud::container::stub::StubControlPlane;
use dispatch_cloud::container::{Container, ContainerState, RuntimeConstraints};
use dispatch_cloud::executor::StubExecutor;
use dispatch_cloud::runtime::DispatcherRuntime;
use dispatch_cloud_driver::stub::{StubDriver, StubDriverConfig, StubInstanceSet, StubVm};

pub const GIB: i64 = 1 << 30;

/// UUID of the dispatcher's own API token.
pub const TOKEN_UUID: &str = "zzzzz-gj3su-000000000000000";

const INSTANCE_TYPES: &str = r#"[
    {"name": "small", "provider_type": "p-small", "vcpus": 1, "ram": 2147483648, "price": 0.1},
    {"name": "big", "provider_type": "p-big", "vcpus": 8, "ram": 17179869184, "price": 1.0}
]"#;

/// Test context holding a running dispatcher and its fake surroundings.
pub struct TestContext {
    pub cp: StubControlPlane,
    pub driver: StubDriver,
    pub runtime: DispatcherRuntime,
}

impl TestContext {
    /// Start a dispatcher with short probe and sync intervals.
    ///
    /// `overrides` are variable names without the `DISPATCH_CLOUD_` prefix.
    pub async fn start(driver_config: StubDriverConfig, overrides: &[(&str, &str)]) -> Self {
        Self::start_with(StubControlPlane::new(TOKEN_UUID), StubDriver::new(driver_config), overrides)
            .await
    }

    /// Start a dispatcher against an existing control plane and driver, as a
    /// restarted process would.
    pub async fn start_with(
        cp: StubControlPlane,
        driver: StubDriver,
        overrides: &[(&str, &str)],
    ) -> Self {
        let runtime = DispatcherRuntime::builder()
            .config(config(overrides))
            .driver(Arc::new(driver.clone()))
            .control_plane(Arc::new(cp.clone()))
            .executor_factory(StubExecutor::driver_factory(driver.clone()))
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");
        Self {
            cp,
            driver,
            runtime,
        }
    }

    /// The instance set the dispatcher is using.
    pub async fn set(&self) -> StubInstanceSet {
        self.driver.instance_sets().await.remove(0)
    }

    /// Wait until `uuid` reaches `state` in the control plane.
    pub async fn wait_for_state(&self, uuid: &str, state: ContainerState, timeout: Duration) {
        let cp = self.cp.clone();
        let uuid = uuid.to_string();
        wait_until(&format!("{} to be {}", uuid, state), timeout, || {
            let cp = cp.clone();
            let uuid = uuid.clone();
            async move { cp.container(&uuid).await.is_some_and(|c| c.state == state) }
        })
        .await;
    }

    /// Wait until a supervisor for `uuid` has been started on some VM.
    pub async fn wait_for_supervisor(&self, uuid: &str, timeout: Duration) -> Arc<StubVm> {
        let deadline = Instant::now() + timeout;
        loop {
            for vm in self.set().await.vms().await {
                if started_on(&vm, uuid).await {
                    return vm;
                }
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for a supervisor for {}", uuid);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stop the dispatcher.
    pub async fn shutdown(self) -> (StubControlPlane, StubDriver) {
        self.runtime.shutdown().await.expect("Failed to shut down runtime");
        (self.cp, self.driver)
    }
}

/// Dispatcher configuration for tests.
pub fn config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("API_HOST", "api.example"),
        ("API_TOKEN", "v2/zzzzz-gj3su-000000000000000/secret"),
        ("INSTANCE_TYPES", INSTANCE_TYPES),
        ("DRIVER", "stub"),
        ("PROBE_INTERVAL_SECS", "1"),
        ("SYNC_INTERVAL_SECS", "1"),
        ("TIMEOUT_IDLE_SECS", "5"),
    ]
    .into_iter()
    .map(|(k, v)| (format!("DISPATCH_CLOUD_{}", k), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(format!("DISPATCH_CLOUD_{}", k), v.to_string());
    }
    Config::from_lookup(|name| vars.get(name).cloned()).expect("Failed to load config")
}

/// A queued container needing `vcpus` and 1 GiB of RAM.
pub fn container(uuid: &str, priority: i64, vcpus: i64) -> Container {
    Container {
        uuid: uuid.to_string(),
        state: ContainerState::Queued,
        priority,
        runtime_constraints: RuntimeConstraints {
            vcpus,
            ram: GIB,
            keep_cache_ram: 0,
        },
        ..Default::default()
    }
}

/// Whether a supervisor for `uuid` was ever started on `vm`.
pub async fn started_on(vm: &StubVm, uuid: &str) -> bool {
    vm.commands()
        .await
        .iter()
        .any(|c| c.contains("--detach") && c.contains(uuid))
}

/// Poll `cond` every 100ms until it holds, panicking after `timeout`.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
