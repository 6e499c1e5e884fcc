//! Local key-value persistence.
//!
//! The queue and the reference cache are each one JSON document under a
//! fixed key. `KvStorage` keeps that contract small and synchronous so
//! enqueue/remove can persist before returning; the durable backend is
//! SQLite (rusqlite, WAL) with a single `kv_store` table, plus an
//! in-memory implementation for tests and ephemeral fallback.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::StoreError;

/// Storage key for the serialized action queue.
pub const QUEUE_KEY: &str = "offline_action_queue";
/// Storage key for the serialized reference-data snapshot.
pub const CACHE_KEY: &str = "offline_reference_cache";

/// Synchronous string key-value store. Implementations must be cheap
/// enough to call inline from enqueue/remove paths.
pub trait KvStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Durable store backed by `{app_data_dir}/offline.db`.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl SqliteStorage {
    /// Open (or create) the database under `app_data_dir`, set pragmas,
    /// and run pending migrations. On corruption or open failure the
    /// file is deleted and opening retried once — losing local state is
    /// recoverable, refusing to start is not.
    pub fn open(app_data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(app_data_dir)
            .map_err(|e| StoreError::Storage(format!("create data dir: {e}")))?;

        let db_path = app_data_dir.join("offline.db");
        info!("Opening offline store at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!("Offline store open failed ({first_err}), deleting and retrying once");
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)
                    .map_err(|e| StoreError::Storage(format!("open after retry: {e}")))?
            }
        };

        run_migrations(&conn)?;
        info!("Offline store initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// In-memory database with the same schema. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Storage(format!("sqlite open: {e}")))?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }
}

fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| StoreError::Storage(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating offline store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                store_key TEXT PRIMARY KEY,
                store_value TEXT NOT NULL,
                updated_at TEXT DEFAULT (datetime('now'))
            );
            INSERT INTO schema_version (version) VALUES (1);",
        )
        .map_err(|e| StoreError::Storage(format!("migrate v1: {e}")))?;
    }

    Ok(())
}

impl KvStorage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.query_row(
            "SELECT store_value FROM kv_store WHERE store_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::Storage(format!("read kv_store[{key}]: {e}")))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO kv_store (store_key, store_value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(store_key) DO UPDATE SET
                store_value = excluded.store_value,
                updated_at = excluded.updated_at",
            params![key, value],
        )
        .map_err(|e| StoreError::Storage(format!("write kv_store[{key}]: {e}")))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.execute("DELETE FROM kv_store WHERE store_key = ?1", params![key])
            .map_err(|e| StoreError::Storage(format!("delete kv_store[{key}]: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Ephemeral store. Everything is lost on drop; useful for tests and as
/// a fallback when the durable store cannot be opened.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}
