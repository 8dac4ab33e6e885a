// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container control plane client.
//!
//! The dispatcher needs six calls from the control plane: identify itself,
//! list containers with filters, fetch one container, lock, unlock, and
//! update attributes (state and runtime status). [`ControlPlane`] is the seam;
//! [`HttpControlPlane`] speaks the JSON HTTP API with a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use super::Container;

/// Attributes requested from the container list endpoint.
pub const SELECT_FIELDS: &[&str] = &[
    "uuid",
    "state",
    "priority",
    "runtime_constraints",
    "container_image",
    "mounts",
    "scheduling_parameters",
    "created_at",
];

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    /// Transport-level failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The server's answer did not match the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The base URL is unusable.
    #[error("invalid API host: {0}")]
    InvalidHost(String),
}

impl ApiError {
    /// Whether the server reported the record missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }
}

/// One list filter: `[attribute, operator, operand]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Attribute name.
    pub attr: String,
    /// Operator: `=`, `in` or `>`.
    pub op: String,
    /// Operand.
    pub operand: serde_json::Value,
}

impl Filter {
    /// Build a filter.
    pub fn new(attr: &str, op: &str, operand: impl Into<serde_json::Value>) -> Self {
        Self {
            attr: attr.to_string(),
            op: op.to_string(),
            operand: operand.into(),
        }
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.attr, &self.op, &self.operand).serialize(serializer)
    }
}

/// Container list query.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// Filters, all of which must match.
    pub filters: Vec<Filter>,
    /// Attributes to return.
    pub select: Vec<String>,
    /// Sort order.
    pub order: Option<String>,
    /// Page size.
    pub limit: Option<usize>,
}

impl ListParams {
    /// A uuid-ordered query selecting [`SELECT_FIELDS`].
    pub fn ordered_by_uuid(filters: Vec<Filter>, limit: Option<usize>) -> Self {
        Self {
            filters,
            select: SELECT_FIELDS.iter().map(|s| s.to_string()).collect(),
            order: Some("uuid".to_string()),
            limit,
        }
    }
}

/// Container control plane operations.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// UUID of the token this client authenticates with.
    async fn current_token_uuid(&self) -> Result<String, ApiError>;

    /// One page of containers matching `params`.
    async fn list_containers(&self, params: &ListParams) -> Result<Vec<Container>, ApiError>;

    /// Fetch one container.
    async fn get_container(&self, uuid: &str) -> Result<Container, ApiError>;

    /// Acquire the dispatch lock.
    async fn lock(&self, uuid: &str) -> Result<Container, ApiError>;

    /// Release the dispatch lock.
    async fn unlock(&self, uuid: &str) -> Result<Container, ApiError>;

    /// Update container attributes.
    async fn update_container(
        &self,
        uuid: &str,
        attrs: serde_json::Value,
    ) -> Result<Container, ApiError>;
}

#[derive(Deserialize)]
struct ContainerList {
    #[serde(default)]
    items: Vec<Container>,
}

#[derive(Deserialize)]
struct TokenRecord {
    uuid: String,
}

/// HTTP JSON control plane client.
#[derive(Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpControlPlane {
    /// Create a client for `host` using bearer `token`.
    ///
    /// `host` may omit the scheme, in which case https is assumed.
    pub fn new(host: &str, token: &str) -> Result<Self, ApiError> {
        let host = host.trim_end_matches('/');
        if host.is_empty() {
            return Err(ApiError::InvalidHost(host.to_string()));
        }
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/arvados/v1/{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn current_token_uuid(&self) -> Result<String, ApiError> {
        let response = self
            .client
            .get(self.url("api_client_authorizations/current"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let record: TokenRecord = Self::decode(response).await?;
        Ok(record.uuid)
    }

    async fn list_containers(&self, params: &ListParams) -> Result<Vec<Container>, ApiError> {
        let filters = serde_json::to_string(&params.filters)
            .map_err(|e| ApiError::Protocol(e.to_string()))?;
        let mut query: Vec<(&str, String)> = vec![("filters", filters), ("count", "none".into())];
        if !params.select.is_empty() {
            let select = serde_json::to_string(&params.select)
                .map_err(|e| ApiError::Protocol(e.to_string()))?;
            query.push(("select", select));
        }
        if let Some(order) = &params.order {
            query.push(("order", order.clone()));
        }
        if let Some(limit) = params.limit {
            query.push(("limit", limit.to_string()));
        }
        debug!(filters = %query[0].1, "listing containers");
        let response = self
            .client
            .get(self.url("containers"))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?;
        let list: ContainerList = Self::decode(response).await?;
        Ok(list.items)
    }

    async fn get_container(&self, uuid: &str) -> Result<Container, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("containers/{}", uuid)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn lock(&self, uuid: &str) -> Result<Container, ApiError> {
        let response = self
            .client
            .post(self.url(&format!("containers/{}/lock", uuid)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn unlock(&self, uuid: &str) -> Result<Container, ApiError> {
        let response = self
            .client
            .post(self.url(&format!("containers/{}/unlock", uuid)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn update_container(
        &self,
        uuid: &str,
        attrs: serde_json::Value,
    ) -> Result<Container, ApiError> {
        let response = self
            .client
            .put(self.url(&format!("containers/{}", uuid)))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "container": attrs }))
            .send()
            .await?;
        Self::decode(response).await
    }
}
