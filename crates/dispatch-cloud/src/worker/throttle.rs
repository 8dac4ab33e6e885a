// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Back-off after provider rate-limit errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dispatch_cloud_driver::CloudError;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Remembers a rate-limit error until its retry time passes.
///
/// While the error is held, [`Throttle::error`] returns it and callers skip
/// the provider call. When it clears, the `on_clear` callback runs once.
#[derive(Default)]
pub struct Throttle {
    held: Mutex<Option<(CloudError, Instant)>>,
}

impl Throttle {
    /// Create a throttle with nothing held.
    pub fn new() -> Self {
        Self::default()
    }

    /// The held error, if its retry time has not passed.
    pub async fn error(&self) -> Option<CloudError> {
        let held = self.held.lock().await;
        match held.as_ref() {
            Some((err, until)) if Instant::now() < *until => Some(err.clone()),
            _ => None,
        }
    }

    /// Hold `err` if it is a rate-limit error.
    ///
    /// `what` names the call for logging. Returns whether `err` was held.
    pub async fn check_rate_limit_error(
        &self,
        err: &CloudError,
        what: &str,
        on_clear: Arc<dyn Fn() + Send + Sync>,
    ) -> bool {
        let Some(retry_at) = err.earliest_retry() else {
            return false;
        };
        let wait = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let until = Instant::now() + wait;
        warn!(
            error = %err,
            wait_ms = wait.as_millis() as u64,
            "{} rate limited; pausing calls",
            what
        );
        {
            let mut held = self.held.lock().await;
            let later = held.as_ref().is_none_or(|(_, prev)| *prev < until);
            if !later {
                return true;
            }
            *held = Some((err.clone(), until));
        }
        tokio::spawn(async move {
            tokio::time::sleep_until(until).await;
            on_clear();
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn Fn() + Send + Sync>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_holds_until_retry_time() {
        let throttle = Throttle::new();
        let (count, on_clear) = counter();
        let err = CloudError::RateLimited {
            message: "slow down".into(),
            earliest_retry: Utc::now() + chrono::Duration::milliseconds(200),
        };
        assert!(throttle.check_rate_limit_error(&err, "create", on_clear).await);
        assert!(throttle.error().await.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(throttle.error().await.is_some());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(throttle.error().await.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ignores_other_errors() {
        let throttle = Throttle::new();
        let (count, on_clear) = counter();
        let err = CloudError::Quota("InstanceLimitExceeded".into());
        assert!(!throttle.check_rate_limit_error(&err, "create", on_clear).await);
        assert!(throttle.error().await.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
