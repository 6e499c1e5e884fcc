//! Replay engine for the offline action queue.
//!
//! When connectivity returns, `Synchronizer::replay` walks the queue in
//! FIFO order and dispatches each action through a handler registry —
//! one handler per action kind. Replay is strictly sequential: each
//! dispatch is awaited before the next begins, preserving causal order
//! between dependent mutations (a sale before the stock adjustment that
//! references the same product) at the cost of latency linear in queue
//! length.
//!
//! Idempotency is not guaranteed: if a dispatch succeeds remotely but
//! the acknowledgment is lost before the local drain, the next replay
//! duplicates the remote effect. Known limitation of this layer.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::action::{ActionKind, QueuedAction};
use crate::connectivity::ConnectivityMonitor;
use crate::notify::{Notification, NotificationHub};
use crate::queue::PersistentQueue;
use crate::remote::Dispatcher;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// When a queued action is given up on. The defaults retry forever —
/// abandonment must be opted into by the host app.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncPolicy {
    /// Abandon an action after this many failed replay attempts.
    pub max_attempts: Option<u32>,
    /// Abandon an action older than this.
    pub max_age: Option<ChronoDuration>,
}

impl SyncPolicy {
    fn past_limits(&self, action: &QueuedAction, now: DateTime<Utc>) -> bool {
        if let Some(max) = self.max_attempts {
            if action.attempts >= max {
                return true;
            }
        }
        if let Some(max_age) = self.max_age {
            if let Some(created) = action.created_at_utc() {
                if now - created > max_age {
                    return true;
                }
            }
        }
        false
    }
}

/// Aggregate result of one replay pass. A skipped pass (offline, empty
/// queue, or replay already running) reports zero attempted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
}

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// One replay unit: dispatches a single action's remote call sequence.
pub type Handler = for<'a> fn(&'a dyn Dispatcher, &'a Value) -> HandlerFuture<'a>;

/// Closed mapping from action kind to replay handler. Kinds without a
/// handler (written by a newer client) fail dispatch and stay queued.
pub struct HandlerRegistry {
    handlers: HashMap<ActionKind, Handler>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry covering every kind the current build knows.
    pub fn defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(ActionKind::CreateTrip, replay_create_trip);
        registry.register(ActionKind::UpdateTrip, replay_update_trip);
        registry.register(ActionKind::CreateSale, replay_create_sale);
        registry.register(ActionKind::UpdateStock, replay_update_stock);
        registry.register(ActionKind::CreateCustomer, replay_create_customer);
        registry.register(ActionKind::CreateExpense, replay_create_expense);
        registry.register(ActionKind::ClockIn, replay_clock_in);
        registry.register(ActionKind::ClockOut, replay_clock_out);
        registry.register(ActionKind::CreateStockMovement, replay_create_stock_movement);
        registry
    }

    pub fn register(&mut self, kind: ActionKind, handler: Handler) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: &ActionKind) -> Option<&Handler> {
        self.handlers.get(kind)
    }
}

fn replay_create_trip<'a>(d: &'a dyn Dispatcher, p: &'a Value) -> HandlerFuture<'a> {
    Box::pin(async move { d.dispatch("create-trip", p).await })
}

fn replay_update_trip<'a>(d: &'a dyn Dispatcher, p: &'a Value) -> HandlerFuture<'a> {
    Box::pin(async move { d.dispatch("update-trip", p).await })
}

/// A sale also decrements stock for each line item — the compensating
/// calls are a secondary effect of the same queued action, so a failure
/// in any of them marks the whole action failed and it retries as one.
fn replay_create_sale<'a>(d: &'a dyn Dispatcher, payload: &'a Value) -> HandlerFuture<'a> {
    Box::pin(async move {
        d.dispatch("create-sale", payload).await?;

        let items = payload
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for item in items {
            let Some(product_id) = item.get("product_id").and_then(Value::as_str) else {
                continue;
            };
            let quantity = item.get("quantity").and_then(Value::as_f64).unwrap_or(0.0);
            if quantity <= 0.0 {
                continue;
            }
            let adjustment = serde_json::json!({
                "product_id": product_id,
                "warehouse_id": payload.get("warehouse_id").cloned().unwrap_or(Value::Null),
                "quantity_change": -quantity,
                "reason": "sale",
            });
            d.dispatch("update-stock", &adjustment).await?;
        }
        Ok(())
    })
}

fn replay_update_stock<'a>(d: &'a dyn Dispatcher, p: &'a Value) -> HandlerFuture<'a> {
    Box::pin(async move { d.dispatch("update-stock", p).await })
}

fn replay_create_customer<'a>(d: &'a dyn Dispatcher, p: &'a Value) -> HandlerFuture<'a> {
    Box::pin(async move { d.dispatch("create-customer", p).await })
}

fn replay_create_expense<'a>(d: &'a dyn Dispatcher, p: &'a Value) -> HandlerFuture<'a> {
    Box::pin(async move { d.dispatch("create-expense", p).await })
}

fn replay_clock_in<'a>(d: &'a dyn Dispatcher, p: &'a Value) -> HandlerFuture<'a> {
    Box::pin(async move { d.dispatch("clock-in", p).await })
}

fn replay_clock_out<'a>(d: &'a dyn Dispatcher, p: &'a Value) -> HandlerFuture<'a> {
    Box::pin(async move { d.dispatch("clock-out", p).await })
}

fn replay_create_stock_movement<'a>(d: &'a dyn Dispatcher, p: &'a Value) -> HandlerFuture<'a> {
    Box::pin(async move { d.dispatch("create-stock-movement", p).await })
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

pub struct Synchronizer {
    queue: Arc<PersistentQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    dispatcher: Arc<dyn Dispatcher>,
    registry: HandlerRegistry,
    policy: SyncPolicy,
    hub: NotificationHub,
    is_syncing: AtomicBool,
    last_sync: Mutex<Option<String>>,
}

impl Synchronizer {
    pub fn new(
        queue: Arc<PersistentQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        dispatcher: Arc<dyn Dispatcher>,
        registry: HandlerRegistry,
        policy: SyncPolicy,
        hub: NotificationHub,
    ) -> Self {
        Self {
            queue,
            connectivity,
            dispatcher,
            registry,
            policy,
            hub,
            is_syncing: AtomicBool::new(false),
            last_sync: Mutex::new(None),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// RFC 3339 time of the last completed replay pass, this process.
    pub fn last_sync_time(&self) -> Option<String> {
        self.last_sync.lock().ok().and_then(|g| g.clone())
    }

    /// Replay the queue against the remote API, one action at a time in
    /// FIFO order. No-op while offline, with an empty queue, or while
    /// another replay is in flight (guarded, silently ignored).
    ///
    /// A succeeded action is drained immediately, so a crash mid-replay
    /// leaves only the unprocessed remainder for the next pass. A failed
    /// action stays queued with its failure recorded and never blocks
    /// the actions behind it.
    pub async fn replay(&self) -> SyncReport {
        if !self.connectivity.is_online() {
            debug!("replay skipped: offline");
            return SyncReport::default();
        }
        if self.queue.is_empty() {
            debug!("replay skipped: queue empty");
            return SyncReport::default();
        }
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("replay already in progress, ignoring");
            return SyncReport::default();
        }

        let snapshot = self.queue.list();
        let mut report = SyncReport {
            attempted: snapshot.len(),
            ..SyncReport::default()
        };
        let now = Utc::now();

        info!(pending = snapshot.len(), "replaying offline action queue");

        for action in snapshot {
            if self.policy.past_limits(&action, now) {
                warn!(
                    id = %action.id,
                    kind = %action.kind,
                    attempts = action.attempts,
                    "abandoning action past retry policy"
                );
                if let Err(e) = self.queue.remove(&action.id) {
                    warn!(id = %action.id, "failed to remove abandoned action: {e}");
                }
                report.abandoned += 1;
                continue;
            }

            let result = match self.registry.get(&action.kind) {
                Some(handler) => handler(self.dispatcher.as_ref(), &action.payload).await,
                None => Err(format!("no handler for action kind '{}'", action.kind)),
            };

            match result {
                Ok(()) => {
                    if let Err(e) = self.queue.remove(&action.id) {
                        warn!(id = %action.id, "replayed but failed to drain from queue: {e}");
                    }
                    report.succeeded += 1;
                }
                Err(reason) => {
                    warn!(id = %action.id, kind = %action.kind, "replay dispatch failed: {reason}");
                    self.queue.record_failure(&action.id, &reason);
                    report.failed += 1;
                }
            }
        }

        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        self.is_syncing.store(false, Ordering::SeqCst);

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            "replay complete"
        );
        self.hub.emit(Notification::SyncComplete {
            succeeded: report.succeeded,
            failed: report.failed,
            abandoned: report.abandoned,
            total: report.attempted,
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KvStorage, MemoryStorage, QUEUE_KEY};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct StubDispatcher {
        calls: Mutex<Vec<(String, Value)>>,
        /// Reject any dispatch whose payload carries `"poison": true`.
        poison_payloads: bool,
        gate: Option<Arc<Semaphore>>,
    }

    impl StubDispatcher {
        fn recording() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                poison_payloads: false,
                gate: None,
            }
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatcher for StubDispatcher {
        async fn dispatch(&self, kind: &str, payload: &Value) -> Result<(), String> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.poison_payloads && payload.get("poison") == Some(&json!(true)) {
                return Err("Business API server error (HTTP 503)".to_string());
            }
            self.calls
                .lock()
                .unwrap()
                .push((kind.to_string(), payload.clone()));
            Ok(())
        }
    }

    struct TestRig {
        queue: Arc<PersistentQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        hub: NotificationHub,
    }

    fn rig() -> TestRig {
        let hub = NotificationHub::default();
        let storage = Arc::new(MemoryStorage::new());
        let queue = Arc::new(PersistentQueue::load(storage, hub.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::new(hub.clone()));
        connectivity.set_online(true, 0);
        TestRig {
            queue,
            connectivity,
            hub,
        }
    }

    fn synchronizer(rig: &TestRig, dispatcher: Arc<dyn Dispatcher>, policy: SyncPolicy) -> Synchronizer {
        Synchronizer::new(
            rig.queue.clone(),
            rig.connectivity.clone(),
            dispatcher,
            HandlerRegistry::defaults(),
            policy,
            rig.hub.clone(),
        )
    }

    #[tokio::test]
    async fn test_replay_skips_while_offline() {
        let rig = rig();
        rig.connectivity.set_online(false, 0);
        rig.queue.enqueue(ActionKind::ClockIn, json!({})).unwrap();

        let dispatcher = Arc::new(StubDispatcher::recording());
        let sync = synchronizer(&rig, dispatcher.clone(), SyncPolicy::default());

        assert_eq!(sync.replay().await, SyncReport::default());
        assert!(dispatcher.calls().is_empty());
        assert_eq!(rig.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_only_failed_action_in_order() {
        let rig = rig();
        rig.queue.enqueue(ActionKind::CreateCustomer, json!({"n": 1})).unwrap();
        let failing = rig
            .queue
            .enqueue(ActionKind::CreateExpense, json!({"n": 2, "poison": true}))
            .unwrap();
        rig.queue.enqueue(ActionKind::ClockOut, json!({"n": 3})).unwrap();

        let dispatcher = Arc::new(StubDispatcher {
            poison_payloads: true,
            ..StubDispatcher::recording()
        });
        let sync = synchronizer(&rig, dispatcher.clone(), SyncPolicy::default());

        let report = sync.replay().await;
        assert_eq!(
            report,
            SyncReport {
                attempted: 3,
                succeeded: 2,
                failed: 1,
                abandoned: 0
            }
        );

        let remaining = rig.queue.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, failing);
        assert_eq!(remaining[0].attempts, 1);
        assert!(remaining[0].last_error.as_deref().unwrap().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_failed_actions_keep_relative_fifo_order() {
        let rig = rig();
        let a = rig.queue.enqueue(ActionKind::CreateTrip, json!({"poison": true, "n": 1})).unwrap();
        rig.queue.enqueue(ActionKind::ClockIn, json!({"n": 2})).unwrap();
        let b = rig.queue.enqueue(ActionKind::UpdateTrip, json!({"poison": true, "n": 3})).unwrap();

        let dispatcher = Arc::new(StubDispatcher {
            poison_payloads: true,
            ..StubDispatcher::recording()
        });
        let sync = synchronizer(&rig, dispatcher, SyncPolicy::default());
        sync.replay().await;

        let ids: Vec<String> = rig.queue.list().into_iter().map(|x| x.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_without_blocking_the_batch() {
        let rig = rig();
        rig.queue
            .enqueue(ActionKind::Unknown("approve-leave".to_string()), json!({}))
            .unwrap();
        rig.queue.enqueue(ActionKind::ClockIn, json!({})).unwrap();

        let dispatcher = Arc::new(StubDispatcher::recording());
        let sync = synchronizer(&rig, dispatcher.clone(), SyncPolicy::default());

        let report = sync.replay().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        let remaining = rig.queue.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind.as_str(), "approve-leave");
        assert!(remaining[0].last_error.as_deref().unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn test_create_sale_replays_compensating_stock_decrements() {
        let rig = rig();
        rig.queue
            .enqueue(
                ActionKind::CreateSale,
                json!({
                    "customer_id": "c1",
                    "warehouse_id": "w1",
                    "items": [
                        { "product_id": "p1", "quantity": 2, "unit_price": 150 },
                        { "product_id": "p2", "quantity": 1, "unit_price": 900 }
                    ]
                }),
            )
            .unwrap();

        let dispatcher = Arc::new(StubDispatcher::recording());
        let sync = synchronizer(&rig, dispatcher.clone(), SyncPolicy::default());
        let report = sync.replay().await;
        assert_eq!(report.succeeded, 1);

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0, "create-sale");
        assert_eq!(calls[1].0, "update-stock");
        assert_eq!(calls[1].1["product_id"], "p1");
        assert_eq!(calls[1].1["quantity_change"], json!(-2.0));
        assert_eq!(calls[2].1["product_id"], "p2");
        assert_eq!(calls[2].1["warehouse_id"], "w1");
    }

    #[tokio::test]
    async fn test_max_attempts_policy_abandons_action() {
        let rig = rig();
        let id = rig.queue.enqueue(ActionKind::CreateTrip, json!({})).unwrap();
        rig.queue.record_failure(&id, "timeout");
        rig.queue.record_failure(&id, "timeout");

        let dispatcher = Arc::new(StubDispatcher::recording());
        let policy = SyncPolicy {
            max_attempts: Some(2),
            max_age: None,
        };
        let sync = synchronizer(&rig, dispatcher.clone(), policy);

        let report = sync.replay().await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.succeeded, 0);
        assert!(rig.queue.is_empty());
        assert!(dispatcher.calls().is_empty());
    }

    /// Build a rig whose queue was persisted with a hand-written
    /// `created_at`, for exercising age-based policy.
    fn rig_with_persisted_action(created_at: &str) -> TestRig {
        let hub = NotificationHub::default();
        let storage = Arc::new(MemoryStorage::new());
        let action = QueuedAction {
            id: "1700000000000-seeded".to_string(),
            kind: ActionKind::CreateExpense,
            payload: json!({"amount": 10}),
            created_at: created_at.to_string(),
            attempts: 0,
            last_error: None,
        };
        storage
            .set(QUEUE_KEY, &serde_json::to_string(&vec![action]).unwrap())
            .unwrap();

        let queue = Arc::new(PersistentQueue::load(storage, hub.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::new(hub.clone()));
        connectivity.set_online(true, 0);
        TestRig {
            queue,
            connectivity,
            hub,
        }
    }

    #[tokio::test]
    async fn test_max_age_policy_abandons_action() {
        let created = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
        let rig = rig_with_persisted_action(&created);

        let dispatcher = Arc::new(StubDispatcher::recording());
        let policy = SyncPolicy {
            max_attempts: None,
            max_age: Some(ChronoDuration::hours(1)),
        };
        let sync = synchronizer(&rig, dispatcher.clone(), policy);

        let report = sync.replay().await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.succeeded, 0);
        assert!(rig.queue.is_empty());
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_created_at_never_matches_age_limit() {
        // Hand-edited storage can leave an unparseable timestamp; the
        // action must still replay rather than being aged out.
        let rig = rig_with_persisted_action("not-a-timestamp");

        let dispatcher = Arc::new(StubDispatcher::recording());
        let policy = SyncPolicy {
            max_attempts: None,
            max_age: Some(ChronoDuration::hours(1)),
        };
        let sync = synchronizer(&rig, dispatcher.clone(), policy);

        let report = sync.replay().await;
        assert_eq!(report.abandoned, 0);
        assert_eq!(report.succeeded, 1);
        assert!(rig.queue.is_empty());
        assert_eq!(dispatcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_reentrant_replay_is_a_guarded_noop() {
        let rig = rig();
        rig.queue.enqueue(ActionKind::ClockIn, json!({"n": 1})).unwrap();
        rig.queue.enqueue(ActionKind::ClockOut, json!({"n": 2})).unwrap();

        let gate = Arc::new(Semaphore::new(0));
        let dispatcher = Arc::new(StubDispatcher {
            gate: Some(gate.clone()),
            ..StubDispatcher::recording()
        });
        let sync = Arc::new(synchronizer(&rig, dispatcher.clone(), SyncPolicy::default()));

        let first = tokio::spawn({
            let sync = sync.clone();
            async move { sync.replay().await }
        });

        // Let the first replay park on its first dispatch.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sync.is_syncing());

        // Second invocation must not dispatch or drain anything.
        assert_eq!(sync.replay().await, SyncReport::default());

        gate.add_permits(8);
        let report = first.await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(dispatcher.calls().len(), 2);
        assert!(rig.queue.is_empty());
        assert!(!sync.is_syncing());
        assert!(sync.last_sync_time().is_some());
    }
}
