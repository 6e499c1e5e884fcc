//! Salone Biz offline core.
//!
//! Client-side library behind the SME desktop/web shell: captures
//! mutating actions into a durable FIFO queue while the device is
//! offline, keeps a time-boxed snapshot of reference data for offline
//! reads, and replays the queue against the hosted business API once
//! connectivity returns. The shell owns rendering and the platform
//! online/offline signal; this crate owns state, persistence, and the
//! replay protocol.
//!
//! Construct one [`OfflineService`] at startup and pass it by reference
//! to whatever needs it — there is no global instance.

mod action;
mod cache;
mod connectivity;
mod error;
mod notify;
mod queue;
mod remote;
mod storage;
mod sync;

pub use action::{ActionKind, QueuedAction};
pub use cache::{CacheSnapshot, CacheStore, DATASETS, DEFAULT_TTL_MS};
pub use connectivity::ConnectivityMonitor;
pub use error::StoreError;
pub use notify::{Notification, NotificationHub};
pub use queue::{PersistentQueue, QueueStats};
pub use remote::{Dispatcher, ReferenceFetcher, RemoteClient};
pub use storage::{KvStorage, MemoryStorage, SqliteStorage, CACHE_KEY, QUEUE_KEY};
pub use sync::{Handler, HandlerFuture, HandlerRegistry, SyncPolicy, SyncReport, Synchronizer};

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Single-instance service wiring the queue, cache, connectivity state,
/// and synchronizer together over one storage backend and one remote
/// dispatcher. All methods take `&self`; the service is `Send + Sync`
/// and meant to live in an `Arc` owned by the app shell.
pub struct OfflineService {
    hub: NotificationHub,
    connectivity: Arc<ConnectivityMonitor>,
    queue: Arc<PersistentQueue>,
    cache: Arc<CacheStore>,
    synchronizer: Synchronizer,
}

impl OfflineService {
    pub fn new(
        storage: Arc<dyn KvStorage>,
        dispatcher: Arc<dyn Dispatcher>,
        policy: SyncPolicy,
    ) -> Self {
        Self::with_registry(storage, dispatcher, HandlerRegistry::defaults(), policy)
    }

    pub fn with_registry(
        storage: Arc<dyn KvStorage>,
        dispatcher: Arc<dyn Dispatcher>,
        registry: HandlerRegistry,
        policy: SyncPolicy,
    ) -> Self {
        let hub = NotificationHub::default();
        let queue = Arc::new(PersistentQueue::load(storage.clone(), hub.clone()));
        let cache = Arc::new(CacheStore::load(storage, hub.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::new(hub.clone()));
        let synchronizer = Synchronizer::new(
            queue.clone(),
            connectivity.clone(),
            dispatcher,
            registry,
            policy,
            hub.clone(),
        );

        Self {
            hub,
            connectivity,
            queue,
            cache,
            synchronizer,
        }
    }

    /// Receiver for UI notifications (toasts, banners, badges).
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.hub.subscribe()
    }

    /// Forward the platform online/offline signal. Transition
    /// notifications carry the current pending count.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online, self.queue.len());
    }

    /// Capture a mutation into the offline queue; returns its id.
    pub fn enqueue(&self, kind: ActionKind, payload: Value) -> Result<String, StoreError> {
        self.queue.enqueue(kind, payload)
    }

    /// Replay the queue now. See [`Synchronizer::replay`].
    pub async fn replay(&self) -> SyncReport {
        self.synchronizer.replay().await
    }

    /// Refresh the reference snapshot for offline reads. Skipped while
    /// offline — pre-caching exists to prepare for going offline, not
    /// to run during it.
    pub async fn pre_cache(
        &self,
        tenant_id: &str,
        fetcher: &dyn ReferenceFetcher,
    ) -> Result<(), StoreError> {
        if !self.connectivity.is_online() {
            debug!("pre_cache skipped: offline");
            return Ok(());
        }
        self.cache.pre_cache(tenant_id, fetcher).await
    }

    /// Cached records for `dataset`, honoring the freshness window.
    pub fn cached(&self, dataset: &str) -> Option<Vec<Value>> {
        self.cache.get(dataset)
    }

    pub fn clear_cache(&self) -> Result<(), StoreError> {
        self.cache.clear()
    }

    // -- read-only observable state for UI binding ---------------------

    pub fn pending_actions(&self) -> Vec<QueuedAction> {
        self.queue.list()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.synchronizer.is_syncing()
    }

    pub fn last_sync_time(&self) -> Option<String> {
        self.synchronizer.last_sync_time()
    }
}

