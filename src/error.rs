//! Error types for the local persistence layer.
//!
//! Remote dispatch failures deliberately stay plain `String` reasons —
//! they cross the UI boundary as toast text and are never matched on.

use thiserror::Error;

/// Failure writing to or reading from the local key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage backend failed (SQLite error, quota, I/O).
    #[error("storage: {0}")]
    Storage(String),

    /// Persisted state could not be serialized.
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}
