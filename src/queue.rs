//! Durable FIFO queue of deferred mutations.
//!
//! The in-memory list and its persisted JSON form are written through
//! on every change: enqueue/remove do not return before the store
//! write completes, so an immediate reload or crash cannot lose an
//! acknowledged action. Replay order is insertion order — no priority,
//! no reordering.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::action::{ActionKind, QueuedAction};
use crate::error::StoreError;
use crate::notify::{Notification, NotificationHub};
use crate::storage::{KvStorage, QUEUE_KEY};

/// Per-kind pending counts for UI badges.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    /// Actions that have failed at least one replay attempt.
    pub failing: usize,
    pub by_kind: BTreeMap<String, usize>,
}

pub struct PersistentQueue {
    storage: Arc<dyn KvStorage>,
    hub: NotificationHub,
    actions: Mutex<Vec<QueuedAction>>,
}

impl PersistentQueue {
    /// Restore the queue from storage. Absent or unreadable persisted
    /// data initializes an empty queue — fail-open, never fatal.
    pub fn load(storage: Arc<dyn KvStorage>, hub: NotificationHub) -> Self {
        let actions = match storage.get(QUEUE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<QueuedAction>>(&raw) {
                Ok(actions) => {
                    if !actions.is_empty() {
                        info!(pending = actions.len(), "restored offline action queue");
                    }
                    actions
                }
                Err(e) => {
                    warn!("offline queue JSON parse error, starting empty: {e}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("offline queue read failed, starting empty: {e}");
                Vec::new()
            }
        };

        Self {
            storage,
            hub,
            actions: Mutex::new(actions),
        }
    }

    /// Append a new action and persist the full list before returning.
    /// Returns the generated action id so callers can track it.
    pub fn enqueue(&self, kind: ActionKind, payload: serde_json::Value) -> Result<String, StoreError> {
        let action = QueuedAction::new(kind, payload);
        let id = action.id.clone();
        let kind_str = action.kind.to_string();

        let mut actions = self
            .actions
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        actions.push(action);

        if let Err(e) = self.persist(&actions) {
            // Keep memory consistent with storage: the action was never
            // durably captured, so it must not appear queued either.
            actions.pop();
            self.hub.emit(Notification::StorageFailed {
                operation: "enqueue".to_string(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        drop(actions);

        info!(id = %id, kind = %kind_str, "action saved offline");
        self.hub.emit(Notification::SavedOffline { id: id.clone(), kind: kind_str });
        Ok(id)
    }

    /// Remove the action with `id`. Unknown ids are a no-op.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut actions = self
            .actions
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let before = actions.len();
        actions.retain(|a| a.id != id);
        if actions.len() == before {
            return Ok(());
        }
        self.persist(&actions)
    }

    /// Record a failed replay attempt against `id`. Bookkeeping only —
    /// a persistence error here is logged, not propagated, because the
    /// action itself is still safely queued.
    pub fn record_failure(&self, id: &str, reason: &str) {
        let Ok(mut actions) = self.actions.lock() else {
            return;
        };
        let Some(action) = actions.iter_mut().find(|a| a.id == id) else {
            return;
        };
        action.attempts += 1;
        action.last_error = Some(reason.to_string());
        if let Err(e) = self.persist(&actions) {
            warn!(id, "failed to persist replay bookkeeping: {e}");
        }
    }

    /// Current queue in insertion order, oldest first.
    pub fn list(&self) -> Vec<QueuedAction> {
        self.actions
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.actions.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending counts per action kind, for UI badges and diagnostics.
    pub fn stats(&self) -> QueueStats {
        let actions = self.list();
        let mut stats = QueueStats {
            total: actions.len(),
            ..QueueStats::default()
        };
        for action in &actions {
            if action.attempts > 0 {
                stats.failing += 1;
            }
            *stats.by_kind.entry(action.kind.to_string()).or_insert(0) += 1;
        }
        stats
    }

    fn persist(&self, actions: &[QueuedAction]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(actions)?;
        self.storage.set(QUEUE_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn test_queue() -> (Arc<MemoryStorage>, PersistentQueue) {
        let storage = Arc::new(MemoryStorage::new());
        let queue = PersistentQueue::load(storage.clone(), NotificationHub::default());
        (storage, queue)
    }

    #[test]
    fn test_list_preserves_enqueue_order() {
        let (_, queue) = test_queue();
        queue.enqueue(ActionKind::CreateSale, json!({"n": 1})).unwrap();
        queue.enqueue(ActionKind::UpdateStock, json!({"n": 2})).unwrap();
        queue.enqueue(ActionKind::CreateExpense, json!({"n": 3})).unwrap();

        let kinds: Vec<ActionKind> = queue.list().into_iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![ActionKind::CreateSale, ActionKind::UpdateStock, ActionKind::CreateExpense]
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_, queue) = test_queue();
        let id = queue.enqueue(ActionKind::ClockIn, json!({})).unwrap();
        queue.enqueue(ActionKind::ClockOut, json!({})).unwrap();

        queue.remove(&id).unwrap();
        assert_eq!(queue.len(), 1);

        queue.remove(&id).unwrap();
        queue.remove("no-such-id").unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_round_trips_through_storage() {
        let (storage, queue) = test_queue();
        let id = queue
            .enqueue(ActionKind::CreateExpense, json!({"amount": 500, "category": "fuel"}))
            .unwrap();
        let original = queue.list().remove(0);
        drop(queue);

        // Simulate a reload: reconstruct from persisted storage alone.
        let restored = PersistentQueue::load(storage, NotificationHub::default());
        let actions = restored.list();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id, id);
        assert_eq!(actions[0], original);
    }

    #[test]
    fn test_corrupt_persisted_queue_starts_empty() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(QUEUE_KEY, "not json {{{").unwrap();

        let queue = PersistentQueue::load(storage, NotificationHub::default());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_record_failure_updates_bookkeeping_and_persists() {
        let (storage, queue) = test_queue();
        let id = queue.enqueue(ActionKind::CreateTrip, json!({})).unwrap();

        queue.record_failure(&id, "Cannot reach business API");
        queue.record_failure(&id, "Business API server error (HTTP 503)");

        let action = &queue.list()[0];
        assert_eq!(action.attempts, 2);
        assert_eq!(
            action.last_error.as_deref(),
            Some("Business API server error (HTTP 503)")
        );

        let restored = PersistentQueue::load(storage, NotificationHub::default());
        assert_eq!(restored.list()[0].attempts, 2);
    }

    #[test]
    fn test_stats_counts_by_kind() {
        let (_, queue) = test_queue();
        queue.enqueue(ActionKind::CreateSale, json!({})).unwrap();
        queue.enqueue(ActionKind::CreateSale, json!({})).unwrap();
        let id = queue.enqueue(ActionKind::ClockIn, json!({})).unwrap();
        queue.record_failure(&id, "timeout");

        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failing, 1);
        assert_eq!(stats.by_kind.get("create-sale"), Some(&2));
        assert_eq!(stats.by_kind.get("clock-in"), Some(&1));
    }
}
