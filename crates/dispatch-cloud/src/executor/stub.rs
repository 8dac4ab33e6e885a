// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor backed by the stub driver's emulated VMs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dispatch_cloud_driver::stub::{StubDriver, StubInstanceSet, StubVm};
use dispatch_cloud_driver::{CloudError, ExecutorTarget, HostKeyChallenge, Instance, InstanceId};
use tokio::sync::Mutex;

use super::{ExecOutput, Executor, ExecutorError, ExecutorFactory};

#[derive(Default)]
struct StubExecState {
    target: Option<Arc<dyn ExecutorTarget>>,
    host_key: Option<Vec<u8>>,
    closed: bool,
}

/// Where an executor finds its VM.
#[derive(Clone)]
enum VmSource {
    Set(StubInstanceSet),
    Driver(StubDriver),
}

impl VmSource {
    async fn vm(&self, id: &InstanceId) -> Option<Arc<StubVm>> {
        match self {
            VmSource::Set(set) => set.vm(id).await,
            VmSource::Driver(driver) => {
                for set in driver.instance_sets().await {
                    if let Some(vm) = set.vm(id).await {
                        return Some(vm);
                    }
                }
                None
            }
        }
    }
}

/// Runs commands on a [`StubVm`], verifying its host key on first use.
pub struct StubExecutor {
    source: VmSource,
    instance_id: InstanceId,
    state: Mutex<StubExecState>,
}

impl StubExecutor {
    /// Create an executor for `instance_id` in `set`.
    pub fn new(set: StubInstanceSet, instance_id: InstanceId) -> Self {
        Self::with_source(VmSource::Set(set), instance_id)
    }

    fn with_source(source: VmSource, instance_id: InstanceId) -> Self {
        Self {
            source,
            instance_id,
            state: Mutex::new(StubExecState::default()),
        }
    }

    /// A factory creating stub executors for instances of `set`.
    pub fn factory(set: StubInstanceSet) -> ExecutorFactory {
        Self::source_factory(VmSource::Set(set))
    }

    /// A factory creating stub executors for instances in any set `driver`
    /// has handed out, including sets created after the factory.
    pub fn driver_factory(driver: StubDriver) -> ExecutorFactory {
        Self::source_factory(VmSource::Driver(driver))
    }

    fn source_factory(source: VmSource) -> ExecutorFactory {
        Arc::new(move |inst: &Arc<dyn Instance>| {
            Arc::new(StubExecutor::with_source(source.clone(), inst.id()))
                as Arc<dyn super::Executor>
        })
    }
}

struct VmChallenge {
    vm: Arc<StubVm>,
}

#[async_trait]
impl HostKeyChallenge for VmChallenge {
    async fn run(&self, command: &str) -> Result<Vec<u8>, CloudError> {
        let out = self.vm.exec(&BTreeMap::new(), command, None).await?;
        if out.exit_code != 0 {
            return Err(CloudError::HostKey(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl Executor for StubExecutor {
    async fn execute(
        &self,
        env: &BTreeMap<String, String>,
        command: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, ExecutorError> {
        let vm = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ExecutorError::Closed);
            }
            let target = state.target.clone().ok_or(ExecutorError::NoAddress)?;
            if target.address().is_none() {
                return Err(ExecutorError::NoAddress);
            }
            let vm = self
                .source
                .vm(&self.instance_id)
                .await
                .ok_or_else(|| ExecutorError::Transport("connection refused".into()))?;
            let key = vm.host_key();
            match &state.host_key {
                Some(pinned) if *pinned != key => {
                    return Err(ExecutorError::HostKey("host key changed".into()));
                }
                Some(_) => {}
                None => {
                    target
                        .verify_host_key(&key, &VmChallenge { vm: vm.clone() })
                        .await
                        .map_err(ExecutorError::host_key)?;
                    state.host_key = Some(key);
                }
            }
            vm
        };

        let out = vm
            .exec(env, command, stdin.as_deref())
            .await
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;
        if out.exit_code != 0 {
            return Err(ExecutorError::ExitStatus {
                code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(ExecOutput {
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn set_target(&self, target: Arc<dyn ExecutorTarget>) {
        self.state.lock().await.target = Some(target);
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}
