// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud VM dispatcher
//!
//! Runs queued containers on cloud VMs:
//! - Container queue (mirror of the control plane's queue)
//! - Worker pool (one worker per cloud instance)
//! - Scheduler (locks, starts, cancels and kills containers)
//! - Management API (optional)

use std::sync::Arc;
use tracing::{info, warn};

use dispatch_cloud::config::Config;
use dispatch_cloud::container::HttpControlPlane;
use dispatch_cloud::executor::stub::StubExecutor;
use dispatch_cloud::runtime::DispatcherRuntime;
use dispatch_cloud_driver::Driver;
use dispatch_cloud_driver::stub::{StubDriver, StubDriverConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispatch_cloud=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        api_host = %config.api_host,
        driver = %config.driver,
        instance_types = config.instance_types.len(),
        "Starting dispatcher"
    );

    let api = Arc::new(HttpControlPlane::new(&config.api_host, &config.api_token)?);

    let builder = DispatcherRuntime::builder().control_plane(api);
    let builder = match config.driver.as_str() {
        "stub" => {
            let driver = StubDriver::new(StubDriverConfig::default());
            info!(driver = driver.name(), "Driver initialized");
            builder
                .executor_factory(StubExecutor::driver_factory(driver.clone()))
                .driver(Arc::new(driver))
        }
        other => anyhow::bail!("unknown cloud driver {:?}", other),
    };

    let runtime = builder.config(config).build()?.start().await?;

    info!(
        instance_set_id = %runtime.instance_set_id(),
        management_addr = ?runtime.management_addr(),
        "Dispatcher ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Dispatcher shut down");

    Ok(())
}
