// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Management HTTP API.
//!
//! | Route | Behavior |
//! |-------|----------|
//! | `GET /arvados/v1/dispatch/containers` | every queue entry |
//! | `GET /arvados/v1/dispatch/container?container_uuid=` | one queue entry |
//! | `POST /arvados/v1/dispatch/containers/kill?container_uuid=&reason=` | kill a supervisor |
//! | `GET /arvados/v1/dispatch/instances` | every worker |
//! | `POST /arvados/v1/dispatch/instances/{hold,drain,run}?instance_id=` | set idle behavior |
//! | `POST /arvados/v1/dispatch/instances/kill?instance_id=&reason=` | shut down a worker |
//! | `GET /_health/ping` | liveness |
//!
//! Every route requires `Authorization: Bearer <management token>`. With no
//! token configured, every request is refused.
//!
//! In-flight requests are tracked so the age of the oldest one is reported as
//! `max_active_request_age_seconds`. A request whose client went away before
//! the handler finished is reported under `max_abandoned_request_age_seconds`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dispatch_cloud_driver::InstanceId;
use opentelemetry::metrics::Histogram;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::container::{Queue, QueueEnt};
use crate::worker::{IdleBehavior, InstanceView, Pool, PoolError};

/// Shared state for the management handlers.
#[derive(Clone)]
pub struct ManagementState {
    /// Container queue.
    pub queue: Arc<Queue>,
    /// Worker pool.
    pub pool: Pool,
    /// Expected bearer token. Empty disables the API.
    pub token: String,
    /// In-flight request tracking.
    pub requests: RequestTracker,
}

/// How often request ages are reported while the API is served.
const REQUEST_REPORT_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Request tracking
// ============================================================================

/// Tracks when each in-flight management request started.
#[derive(Clone)]
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, Instant>>,
    /// Oldest request abandoned since the last report.
    abandoned: Mutex<Option<Duration>>,
    active_age: Histogram<f64>,
    abandoned_age: Histogram<f64>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    /// Create a tracker recording into the global meter provider.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("dispatch_cloud");
        let active_age = meter
            .f64_histogram("max_active_request_age_seconds")
            .with_description("Age of the oldest in-flight management request")
            .with_unit("s")
            .build();
        let abandoned_age = meter
            .f64_histogram("max_abandoned_request_age_seconds")
            .with_description("Age of the oldest management request abandoned by its client")
            .with_unit("s")
            .build();
        Self {
            inner: Arc::new(TrackerInner {
                next_id: AtomicU64::new(0),
                active: Mutex::new(HashMap::new()),
                abandoned: Mutex::new(None),
                active_age,
                abandoned_age,
            }),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<u64, Instant>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn abandoned(&self) -> MutexGuard<'_, Option<Duration>> {
        self.inner
            .abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a request. It stays in flight until the returned guard
    /// is finished or dropped.
    pub fn start(&self) -> RequestGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        self.active().insert(id, started);
        RequestGuard {
            tracker: self.clone(),
            id,
            started,
            finished: false,
        }
    }

    /// Number of requests in flight.
    pub fn in_flight(&self) -> usize {
        self.active().len()
    }

    /// Age of the oldest in-flight request, zero when there is none.
    pub fn max_active_age(&self) -> Duration {
        self.active()
            .values()
            .min()
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    /// Age of the oldest request abandoned since the last report.
    pub fn max_abandoned_age(&self) -> Option<Duration> {
        *self.abandoned()
    }

    /// Record both ages and reset the abandoned maximum.
    pub fn report(&self) {
        self.inner
            .active_age
            .record(self.max_active_age().as_secs_f64(), &[]);
        if let Some(age) = self.abandoned().take() {
            self.inner.abandoned_age.record(age.as_secs_f64(), &[]);
        }
    }
}

/// A tracked in-flight request.
pub struct RequestGuard {
    tracker: RequestTracker,
    id: u64,
    started: Instant,
    finished: bool,
}

impl RequestGuard {
    /// Mark the request as answered.
    pub fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.active().remove(&self.id);
        if self.finished {
            return;
        }
        let age = self.started.elapsed();
        debug!(age_secs = age.as_secs_f64(), "management request abandoned by client");
        let mut abandoned = self.tracker.abandoned();
        if abandoned.is_none_or(|max| age > max) {
            *abandoned = Some(age);
        }
    }
}

/// List response wrapper.
#[derive(Debug, Serialize, Deserialize)]
pub struct Items<T> {
    /// The listed objects.
    pub items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ContainerParams {
    #[serde(default)]
    container_uuid: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct InstanceParams {
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    reason: String,
}

/// Error answered by a management handler.
#[derive(Debug)]
pub struct ManagementError {
    status: StatusCode,
    message: String,
}

impl ManagementError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ManagementError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, message = %self.message, "management request failed");
        }
        (
            self.status,
            Json(serde_json::json!({ "errors": [self.message] })),
        )
            .into_response()
    }
}

impl From<PoolError> for ManagementError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::InstanceNotFound(_) => Self::not_found(err.to_string()),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

/// Build the management router.
pub fn router(state: ManagementState) -> Router {
    Router::new()
        .route("/arvados/v1/dispatch/containers", get(list_containers))
        .route("/arvados/v1/dispatch/container", get(get_container))
        .route("/arvados/v1/dispatch/containers/kill", post(kill_container))
        .route("/arvados/v1/dispatch/instances", get(list_instances))
        .route("/arvados/v1/dispatch/instances/hold", post(hold_instance))
        .route("/arvados/v1/dispatch/instances/drain", post(drain_instance))
        .route("/arvados/v1/dispatch/instances/run", post(run_instance))
        .route("/arvados/v1/dispatch/instances/kill", post(kill_instance))
        .route("/_health/ping", get(ping))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

/// Serve the management API on `addr` until `shutdown` is notified.
pub async fn serve(
    addr: SocketAddr,
    state: ManagementState,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Management API listening");
    let requests = state.requests.clone();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REQUEST_REPORT_INTERVAL);
        loop {
            ticker.tick().await;
            requests.report();
        }
    });
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await;
    reporter.abort();
    result?;
    info!("Management API stopped");
    Ok(())
}

async fn track_requests(
    State(state): State<ManagementState>,
    request: Request,
    next: Next,
) -> Response {
    let guard = state.requests.start();
    state.requests.report();
    let response = next.run(request).await;
    guard.finish();
    response
}

async fn require_token(
    State(state): State<ManagementState>,
    request: Request,
    next: Next,
) -> Result<Response, ManagementError> {
    if state.token.is_empty() {
        return Err(ManagementError::new(
            StatusCode::FORBIDDEN,
            "Management API authentication is not configured",
        ));
    }
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(state.token.as_str()) {
        return Err(ManagementError::new(StatusCode::UNAUTHORIZED, "Unauthorized"));
    }
    Ok(next.run(request).await)
}

async fn list_containers(State(state): State<ManagementState>) -> Json<Items<QueueEnt>> {
    let (entries, _) = state.queue.entries().await;
    let mut items: Vec<QueueEnt> = entries.into_values().collect();
    items.sort_by(|a, b| {
        a.first_seen_at
            .cmp(&b.first_seen_at)
            .then_with(|| a.container.uuid.cmp(&b.container.uuid))
    });
    Json(Items { items })
}

async fn get_container(
    State(state): State<ManagementState>,
    Query(params): Query<ContainerParams>,
) -> Result<Json<QueueEnt>, ManagementError> {
    if params.container_uuid.is_empty() {
        return Err(ManagementError::bad_request("container_uuid parameter not provided"));
    }
    let (mut entries, _) = state.queue.entries().await;
    entries
        .remove(&params.container_uuid)
        .map(Json)
        .ok_or_else(|| ManagementError::not_found("container not found"))
}

async fn kill_container(
    State(state): State<ManagementState>,
    Query(params): Query<ContainerParams>,
) -> Result<StatusCode, ManagementError> {
    if params.container_uuid.is_empty() {
        return Err(ManagementError::bad_request("container_uuid parameter not provided"));
    }
    let reason = format!("via management API: {}", params.reason);
    if !state.pool.kill_container(&params.container_uuid, &reason).await {
        return Err(ManagementError::not_found("container not found"));
    }
    Ok(StatusCode::OK)
}

async fn list_instances(State(state): State<ManagementState>) -> Json<Items<InstanceView>> {
    Json(Items {
        items: state.pool.instances().await,
    })
}

fn instance_id(params: &InstanceParams) -> Result<InstanceId, ManagementError> {
    if params.instance_id.is_empty() {
        return Err(ManagementError::bad_request("instance_id parameter not provided"));
    }
    Ok(InstanceId::from(params.instance_id.as_str()))
}

async fn set_idle_behavior(
    state: &ManagementState,
    params: &InstanceParams,
    behavior: IdleBehavior,
) -> Result<StatusCode, ManagementError> {
    let id = instance_id(params)?;
    state.pool.set_idle_behavior(&id, behavior).await?;
    Ok(StatusCode::OK)
}

async fn hold_instance(
    State(state): State<ManagementState>,
    Query(params): Query<InstanceParams>,
) -> Result<StatusCode, ManagementError> {
    set_idle_behavior(&state, &params, IdleBehavior::Hold).await
}

async fn drain_instance(
    State(state): State<ManagementState>,
    Query(params): Query<InstanceParams>,
) -> Result<StatusCode, ManagementError> {
    set_idle_behavior(&state, &params, IdleBehavior::Drain).await
}

async fn run_instance(
    State(state): State<ManagementState>,
    Query(params): Query<InstanceParams>,
) -> Result<StatusCode, ManagementError> {
    set_idle_behavior(&state, &params, IdleBehavior::Run).await
}

async fn kill_instance(
    State(state): State<ManagementState>,
    Query(params): Query<InstanceParams>,
) -> Result<StatusCode, ManagementError> {
    let id = instance_id(&params)?;
    let reason = format!("via management API: {}", params.reason);
    state.pool.kill_instance(&id, &reason).await?;
    Ok(StatusCode::OK)
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "health": "OK" }))
}
