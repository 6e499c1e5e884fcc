//! Notification surface for the UI layer.
//!
//! The core emits plain data events; the host app renders them as
//! toasts, banners, or badges. Nothing here blocks: events are sent on
//! a broadcast channel and dropped when no subscriber is listening.

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Notification-worthy state changes, serializable for event bridges.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A mutation was captured into the offline queue.
    SavedOffline { id: String, kind: String },
    /// Connectivity was lost; `pending` feeds the persistent banner.
    WentOffline { pending: usize },
    /// Connectivity returned with queued work; the UI may prompt to sync.
    BackOnline { pending: usize },
    /// A replay pass finished.
    SyncComplete {
        succeeded: usize,
        failed: usize,
        abandoned: usize,
        total: usize,
    },
    /// The reference snapshot was rebuilt; counts are per dataset.
    CacheRefreshed {
        tenant_id: String,
        datasets: BTreeMap<String, usize>,
        total: usize,
    },
    /// Local persistence failed; the triggering operation may be lost.
    StorageFailed { operation: String, reason: String },
}

/// Fan-out channel for [`Notification`] events.
#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Best-effort emit. A send error only means nobody is subscribed.
    pub fn emit(&self, notification: Notification) {
        debug!(?notification, "notification");
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let hub = NotificationHub::default();
        hub.emit(Notification::WentOffline { pending: 3 });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let hub = NotificationHub::default();
        let mut rx = hub.subscribe();

        hub.emit(Notification::BackOnline { pending: 2 });
        hub.emit(Notification::SyncComplete {
            succeeded: 2,
            failed: 0,
            abandoned: 0,
            total: 2,
        });

        assert_eq!(rx.recv().await.unwrap(), Notification::BackOnline { pending: 2 });
        assert!(matches!(
            rx.recv().await.unwrap(),
            Notification::SyncComplete { succeeded: 2, .. }
        ));
    }

    #[test]
    fn test_notification_serializes_tagged() {
        let json = serde_json::to_value(Notification::SavedOffline {
            id: "1-a".into(),
            kind: "create-sale".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "saved_offline");
        assert_eq!(json["kind"], "create-sale");
    }
}
