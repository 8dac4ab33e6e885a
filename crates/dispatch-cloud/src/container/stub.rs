// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory control plane for tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::api::{ApiError, ControlPlane, Filter, ListParams};
use super::{Container, ContainerState};

#[derive(Default)]
struct StubState {
    containers: BTreeMap<String, Container>,
    runtime_errors: BTreeMap<String, String>,
    calls: HashMap<&'static str, usize>,
    fail_lists: usize,
    fail_ops: HashMap<String, ApiError>,
}

/// Control plane that keeps container records in memory.
///
/// Lock and unlock follow the real state rules: only `Queued` containers can
/// be locked and only `Locked` ones unlocked.
#[derive(Clone)]
pub struct StubControlPlane {
    token_uuid: String,
    state: Arc<Mutex<StubState>>,
}

impl Default for StubControlPlane {
    fn default() -> Self {
        Self::new("zzzzz-gj3su-000000000000000")
    }
}

impl StubControlPlane {
    /// Create an empty control plane whose token has `token_uuid`.
    pub fn new(token_uuid: &str) -> Self {
        Self {
            token_uuid: token_uuid.to_string(),
            state: Arc::new(Mutex::new(StubState::default())),
        }
    }

    /// Insert or replace a container record.
    pub async fn put(&self, container: Container) {
        let mut state = self.state.lock().await;
        state.containers.insert(container.uuid.clone(), container);
    }

    /// Remove a container record entirely.
    pub async fn delete(&self, uuid: &str) {
        self.state.lock().await.containers.remove(uuid);
    }

    /// Current record for `uuid`.
    pub async fn container(&self, uuid: &str) -> Option<Container> {
        self.state.lock().await.containers.get(uuid).cloned()
    }

    /// Change a container's state directly, as another component would.
    pub async fn set_state(&self, uuid: &str, new_state: ContainerState) {
        let mut state = self.state.lock().await;
        if let Some(c) = state.containers.get_mut(uuid) {
            c.state = new_state;
            if !matches!(new_state, ContainerState::Locked | ContainerState::Running) {
                c.locked_by_uuid = None;
            }
        }
    }

    /// `runtime_status.error` written for `uuid`, if any.
    pub async fn runtime_error(&self, uuid: &str) -> Option<String> {
        self.state.lock().await.runtime_errors.get(uuid).cloned()
    }

    /// Number of calls made to `op` (`list`, `get`, `lock`, `unlock`, `update`, `current`).
    pub async fn calls(&self, op: &str) -> usize {
        let state = self.state.lock().await;
        state.calls.get(op).copied().unwrap_or(0)
    }

    /// Make the next `count` list calls fail.
    pub async fn fail_lists(&self, count: usize) {
        self.state.lock().await.fail_lists = count;
    }

    /// Make the next `op` call for `uuid` fail with `err`.
    pub async fn fail_op(&self, op: &str, uuid: &str, err: ApiError) {
        let mut state = self.state.lock().await;
        state.fail_ops.insert(format!("{}:{}", op, uuid), err);
    }

    fn conflict(uuid: &str, msg: &str) -> ApiError {
        ApiError::Status {
            status: 422,
            body: format!("{}: {}", uuid, msg),
        }
    }

    fn not_found(uuid: &str) -> ApiError {
        ApiError::Status {
            status: 404,
            body: format!("{} not found", uuid),
        }
    }
}

fn count(state: &mut StubState, op: &'static str) {
    *state.calls.entry(op).or_default() += 1;
}

fn take_failure(state: &mut StubState, op: &str, uuid: &str) -> Result<(), ApiError> {
    match state.fail_ops.remove(&format!("{}:{}", op, uuid)) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn compare(have: &Value, operand: &Value) -> Option<std::cmp::Ordering> {
    match (have, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Number(a), Value::String(b)) => a.as_f64()?.partial_cmp(&b.parse::<f64>().ok()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn matches_filter(record: &Value, filter: &Filter) -> bool {
    let have = record.get(&filter.attr).unwrap_or(&Value::Null);
    match filter.op.as_str() {
        "=" => compare(have, &filter.operand) == Some(std::cmp::Ordering::Equal) || have == &filter.operand,
        "in" => filter
            .operand
            .as_array()
            .is_some_and(|list| list.iter().any(|v| v == have)),
        ">" => compare(have, &filter.operand) == Some(std::cmp::Ordering::Greater),
        _ => false,
    }
}

#[async_trait]
impl ControlPlane for StubControlPlane {
    async fn current_token_uuid(&self) -> Result<String, ApiError> {
        count(&mut *self.state.lock().await, "current");
        Ok(self.token_uuid.clone())
    }

    async fn list_containers(&self, params: &ListParams) -> Result<Vec<Container>, ApiError> {
        let mut state = self.state.lock().await;
        count(&mut state, "list");
        if state.fail_lists > 0 {
            state.fail_lists -= 1;
            return Err(ApiError::Status {
                status: 503,
                body: "stub: list unavailable".into(),
            });
        }
        let mut out = Vec::new();
        for c in state.containers.values() {
            let record = serde_json::to_value(c).map_err(|e| ApiError::Protocol(e.to_string()))?;
            if params.filters.iter().all(|f| matches_filter(&record, f)) {
                out.push(c.clone());
                if params.limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn get_container(&self, uuid: &str) -> Result<Container, ApiError> {
        let mut state = self.state.lock().await;
        count(&mut state, "get");
        take_failure(&mut state, "get", uuid)?;
        state
            .containers
            .get(uuid)
            .cloned()
            .ok_or_else(|| Self::not_found(uuid))
    }

    async fn lock(&self, uuid: &str) -> Result<Container, ApiError> {
        let mut state = self.state.lock().await;
        count(&mut state, "lock");
        take_failure(&mut state, "lock", uuid)?;
        let token_uuid = self.token_uuid.clone();
        let c = state
            .containers
            .get_mut(uuid)
            .ok_or_else(|| Self::not_found(uuid))?;
        if c.state != ContainerState::Queued {
            return Err(Self::conflict(uuid, "cannot lock unless Queued"));
        }
        c.state = ContainerState::Locked;
        c.locked_by_uuid = Some(token_uuid);
        Ok(c.clone())
    }

    async fn unlock(&self, uuid: &str) -> Result<Container, ApiError> {
        let mut state = self.state.lock().await;
        count(&mut state, "unlock");
        take_failure(&mut state, "unlock", uuid)?;
        let c = state
            .containers
            .get_mut(uuid)
            .ok_or_else(|| Self::not_found(uuid))?;
        if c.state != ContainerState::Locked {
            return Err(Self::conflict(uuid, "cannot unlock unless Locked"));
        }
        c.state = ContainerState::Queued;
        c.locked_by_uuid = None;
        Ok(c.clone())
    }

    async fn update_container(&self, uuid: &str, attrs: Value) -> Result<Container, ApiError> {
        let mut state = self.state.lock().await;
        count(&mut state, "update");
        take_failure(&mut state, "update", uuid)?;
        if let Some(err) = attrs
            .get("runtime_status")
            .and_then(|rs| rs.get("error"))
            .and_then(Value::as_str)
        {
            state.runtime_errors.insert(uuid.to_string(), err.to_string());
        }
        let c = state
            .containers
            .get_mut(uuid)
            .ok_or_else(|| Self::not_found(uuid))?;
        if let Some(new_state) = attrs.get("state") {
            let new_state: ContainerState = serde_json::from_value(new_state.clone())
                .map_err(|e| ApiError::Protocol(e.to_string()))?;
            if c.state.is_final() && new_state != c.state {
                return Err(Self::conflict(uuid, "container is already final"));
            }
            c.state = new_state;
            if new_state.is_final() {
                c.locked_by_uuid = None;
            }
        }
        if let Some(priority) = attrs.get("priority").and_then(Value::as_i64) {
            c.priority = priority;
        }
        Ok(c.clone())
    }
}
