//! Reference-data snapshot for offline reads.
//!
//! A single tenant-scoped snapshot of the reference datasets (products,
//! customers, vehicles, warehouses, employees), persisted as one JSON
//! document and bounded by a freshness window. Expiry is evaluated on
//! every read; there is no background timer and no implicit re-fetch.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::notify::{Notification, NotificationHub};
use crate::remote::ReferenceFetcher;
use crate::storage::{KvStorage, CACHE_KEY};

/// Dataset names in the snapshot, in fetch order.
pub const DATASETS: &[&str] = &["products", "customers", "vehicles", "warehouses", "employees"];

/// Snapshots older than this are treated as absent.
pub const DEFAULT_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// One capture of the reference datasets for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Capture time, epoch milliseconds.
    pub timestamp: i64,
    pub tenant_id: String,
    pub entities: BTreeMap<String, Vec<Value>>,
}

impl CacheSnapshot {
    fn is_fresh(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms - self.timestamp < ttl_ms
    }
}

pub struct CacheStore {
    storage: Arc<dyn KvStorage>,
    hub: NotificationHub,
    ttl_ms: i64,
    snapshot: Mutex<Option<CacheSnapshot>>,
}

impl CacheStore {
    pub fn load(storage: Arc<dyn KvStorage>, hub: NotificationHub) -> Self {
        Self::load_with_ttl(storage, hub, DEFAULT_TTL_MS)
    }

    /// Restore the snapshot from storage with an explicit freshness
    /// window. Unreadable persisted data starts empty, like the queue.
    pub fn load_with_ttl(storage: Arc<dyn KvStorage>, hub: NotificationHub, ttl_ms: i64) -> Self {
        let snapshot = match storage.get(CACHE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<CacheSnapshot>(&raw) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("reference cache JSON parse error, starting empty: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("reference cache read failed, starting empty: {e}");
                None
            }
        };

        Self {
            storage,
            hub,
            ttl_ms,
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Merge `records` under `dataset`, refreshing the snapshot
    /// timestamp. A snapshot for a different tenant, or one past the
    /// freshness window, is replaced, not merged into — re-stamping an
    /// expired snapshot would serve its other datasets as fresh again.
    pub fn put(&self, tenant_id: &str, dataset: &str, records: Vec<Value>) -> Result<(), StoreError> {
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let now_ms = Utc::now().timestamp_millis();
        let mut snapshot = match guard.take() {
            Some(s) if s.tenant_id == tenant_id && s.is_fresh(now_ms, self.ttl_ms) => s,
            _ => CacheSnapshot {
                timestamp: 0,
                tenant_id: tenant_id.to_string(),
                entities: BTreeMap::new(),
            },
        };
        snapshot.timestamp = now_ms;
        snapshot.entities.insert(dataset.to_string(), records);

        let raw = serde_json::to_string(&snapshot)?;
        self.storage.set(CACHE_KEY, &raw)?;
        *guard = Some(snapshot);
        Ok(())
    }

    /// Cached records for `dataset`, or `None` when no snapshot exists,
    /// the snapshot has expired, or the dataset was never captured.
    /// An expired snapshot is dropped on the spot.
    pub fn get(&self, dataset: &str) -> Option<Vec<Value>> {
        let mut guard = self.snapshot.lock().ok()?;
        let snapshot = guard.as_ref()?;

        if !snapshot.is_fresh(Utc::now().timestamp_millis(), self.ttl_ms) {
            info!(tenant_id = %snapshot.tenant_id, "reference cache expired, clearing");
            *guard = None;
            if let Err(e) = self.storage.remove(CACHE_KEY) {
                warn!("failed to clear expired reference cache: {e}");
            }
            return None;
        }

        guard.as_ref()?.entities.get(dataset).cloned()
    }

    /// Fetch all reference datasets for `tenant_id` concurrently and
    /// persist them as one fresh snapshot. A failed dataset is logged
    /// and omitted — it never aborts the others and the operation still
    /// reports completion. Callers gate on connectivity.
    pub async fn pre_cache(
        &self,
        tenant_id: &str,
        fetcher: &dyn ReferenceFetcher,
    ) -> Result<(), StoreError> {
        let (products, customers, vehicles, warehouses, employees) = tokio::join!(
            fetcher.fetch_products(tenant_id),
            fetcher.fetch_customers(tenant_id),
            fetcher.fetch_vehicles(tenant_id),
            fetcher.fetch_warehouses(tenant_id),
            fetcher.fetch_employees(tenant_id),
        );

        let mut entities = BTreeMap::new();
        let mut counts = BTreeMap::new();
        let results = [
            ("products", products),
            ("customers", customers),
            ("vehicles", vehicles),
            ("warehouses", warehouses),
            ("employees", employees),
        ];
        for (dataset, result) in results {
            match result {
                Ok(records) => {
                    counts.insert(dataset.to_string(), records.len());
                    entities.insert(dataset.to_string(), records);
                }
                Err(e) => {
                    warn!(dataset, "reference fetch failed, dataset omitted: {e}");
                }
            }
        }

        let total: usize = counts.values().sum();
        let snapshot = CacheSnapshot {
            timestamp: Utc::now().timestamp_millis(),
            tenant_id: tenant_id.to_string(),
            entities,
        };

        let raw = serde_json::to_string(&snapshot)?;
        self.storage.set(CACHE_KEY, &raw)?;
        if let Ok(mut guard) = self.snapshot.lock() {
            *guard = Some(snapshot);
        }

        info!(tenant_id, total, "reference cache refreshed");
        self.hub.emit(Notification::CacheRefreshed {
            tenant_id: tenant_id.to_string(),
            datasets: counts,
            total,
        });
        Ok(())
    }

    /// Wipe the snapshot immediately.
    pub fn clear(&self) -> Result<(), StoreError> {
        if let Ok(mut guard) = self.snapshot.lock() {
            *guard = None;
        }
        self.storage.remove(CACHE_KEY)
    }

    /// Capture time of the current snapshot, if one exists in memory.
    pub fn snapshot_timestamp(&self) -> Option<i64> {
        self.snapshot.lock().ok()?.as_ref().map(|s| s.timestamp)
    }
}
