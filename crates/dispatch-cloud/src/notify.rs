// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coalescing change notifications.
//!
//! A [`Notifier`] bumps a counter on every change. A [`Subscription`] wakes
//! once for any number of changes that happened since it last looked, so a
//! slow subscriber never blocks the notifier and never sees a backlog.

use tokio::sync::watch;

/// Publishes change notifications.
#[derive(Debug)]
pub struct Notifier {
    tx: watch::Sender<u64>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    /// Create a notifier with no subscribers.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Wake every subscriber.
    pub fn notify(&self) {
        self.tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Subscribe to future notifications.
    pub fn subscribe(&self) -> Subscription {
        let mut rx = self.tx.subscribe();
        rx.mark_unchanged();
        Subscription { rx }
    }
}

/// Receives coalesced notifications.
#[derive(Debug, Clone)]
pub struct Subscription {
    rx: watch::Receiver<u64>,
}

impl Subscription {
    /// Wait until at least one notification arrives after the last call.
    ///
    /// Returns `false` when the notifier has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Whether a notification is pending, consuming it.
    pub fn has_changed(&mut self) -> bool {
        let changed = self.rx.has_changed().unwrap_or(false);
        if changed {
            self.rx.mark_unchanged();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notifications_coalesce() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe();
        assert!(!sub.has_changed());

        notifier.notify();
        notifier.notify();
        notifier.notify();
        assert!(sub.changed().await);

        let pending = tokio::time::timeout(Duration::from_millis(20), sub.changed()).await;
        assert!(pending.is_err(), "three notifications should coalesce into one");
    }

    #[tokio::test]
    async fn test_dropped_notifier_ends_subscription() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe();
        drop(notifier);
        assert!(!sub.changed().await);
    }
}
