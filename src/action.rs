//! Queued action model.
//!
//! A `QueuedAction` is a durable record of one deferred mutation,
//! created while the client is offline and removed only after the
//! remote API confirms the replayed call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of mutation kinds the client can defer. Serialized as the
/// kebab-case strings the queue has always used on disk.
///
/// `Unknown` catches kinds written by a newer client version so an old
/// build still loads the persisted queue; unknown kinds fail dispatch
/// and stay queued instead of poisoning deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    CreateTrip,
    UpdateTrip,
    CreateSale,
    UpdateStock,
    CreateCustomer,
    CreateExpense,
    ClockIn,
    ClockOut,
    CreateStockMovement,
    #[serde(untagged)]
    Unknown(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::CreateTrip => "create-trip",
            ActionKind::UpdateTrip => "update-trip",
            ActionKind::CreateSale => "create-sale",
            ActionKind::UpdateStock => "update-stock",
            ActionKind::CreateCustomer => "create-customer",
            ActionKind::CreateExpense => "create-expense",
            ActionKind::ClockIn => "clock-in",
            ActionKind::ClockOut => "clock-out",
            ActionKind::CreateStockMovement => "create-stock-movement",
            ActionKind::Unknown(kind) => kind,
        }
    }

    /// Every kind the current build knows how to replay.
    pub const KNOWN: &'static [ActionKind] = &[
        ActionKind::CreateTrip,
        ActionKind::UpdateTrip,
        ActionKind::CreateSale,
        ActionKind::UpdateStock,
        ActionKind::CreateCustomer,
        ActionKind::CreateExpense,
        ActionKind::ClockIn,
        ActionKind::ClockOut,
        ActionKind::CreateStockMovement,
    ];
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deferred mutation. `id`, `kind`, `payload` and `created_at` are
/// immutable after enqueue; `attempts`/`last_error` are replay
/// bookkeeping updated on failed dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: String,
    pub kind: ActionKind,
    pub payload: Value,
    pub created_at: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedAction {
    pub fn new(kind: ActionKind, payload: Value) -> Self {
        let now = Utc::now();
        // Millisecond prefix keeps ids sorted by creation time; the uuid
        // suffix keeps them unique within the same millisecond.
        let id = format!("{}-{}", now.timestamp_millis(), Uuid::new_v4().simple());
        Self {
            id,
            kind,
            payload,
            created_at: now.to_rfc3339(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Parsed creation time, `None` when `created_at` is unreadable
    /// (hand-edited storage); age-based policies then never match.
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}
