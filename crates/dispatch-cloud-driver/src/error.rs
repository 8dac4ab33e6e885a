// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types returned by cloud drivers.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

/// Errors returned by drivers, instance sets and instances.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CloudError {
    /// The provider rejected the call because of API rate limiting.
    #[error("rate limited: {message} (earliest retry {earliest_retry})")]
    RateLimited {
        /// Provider message.
        message: String,
        /// Calls to the same API surface should not be retried before this time.
        earliest_retry: DateTime<Utc>,
    },

    /// The account is out of capacity (instances, vCPUs, addresses...).
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// The instance set has been stopped and accepts no more calls.
    #[error("instance set is stopped")]
    Stopped,

    /// The instance does not exist.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The remote host key could not be verified.
    #[error("host key verification failed: {0}")]
    HostKey(String),

    /// The driver does not implement this operation.
    #[error("operation not implemented by driver")]
    NotImplemented,

    /// Driver parameters are invalid.
    #[error("invalid driver configuration: {0}")]
    Config(String),

    /// Any other provider failure.
    #[error("provider error: {0}")]
    Provider(String),
}

impl CloudError {
    /// The time before which a rate-limited call should not be retried.
    pub fn earliest_retry(&self) -> Option<DateTime<Utc>> {
        match self {
            CloudError::RateLimited { earliest_retry, .. } => Some(*earliest_retry),
            _ => None,
        }
    }

    /// Whether this error means the account has hit a provider quota.
    ///
    /// Besides the explicit [`CloudError::Quota`] variant, provider messages
    /// mentioning "exceed", "quota" or "limit" (case-insensitive) count too.
    pub fn is_quota_error(&self) -> bool {
        match self {
            CloudError::Quota(_) => true,
            CloudError::Provider(message) => looks_like_quota(message),
            _ => false,
        }
    }
}

/// Check a provider error code or message for quota wording.
pub fn looks_like_quota(message: &str) -> bool {
    static QUOTA: OnceLock<Option<Regex>> = OnceLock::new();
    QUOTA
        .get_or_init(|| Regex::new(r"(?i)exceed|quota|limit").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_rate_limited_exposes_earliest_retry() {
        let at = Utc::now() + Duration::milliseconds(200);
        let err = CloudError::RateLimited {
            message: "RequestLimitExceeded".to_string(),
            earliest_retry: at,
        };
        assert_eq!(err.earliest_retry(), Some(at));
        assert!(!err.is_quota_error());
    }

    #[test]
    fn test_quota_shapes() {
        assert!(CloudError::Quota("InstanceLimitExceeded".into()).is_quota_error());
        assert!(CloudError::Provider("VcpuLimitExceeded: too many".into()).is_quota_error());
        assert!(CloudError::Provider("Operation would EXCEED the QUOTA".into()).is_quota_error());
        assert!(!CloudError::Provider("connection reset".into()).is_quota_error());
        assert!(!CloudError::Stopped.is_quota_error());
    }

    #[test]
    fn test_other_errors_have_no_retry_time() {
        assert!(CloudError::Provider("boom".into()).earliest_retry().is_none());
        assert!(CloudError::NotImplemented.earliest_retry().is_none());
    }
}
