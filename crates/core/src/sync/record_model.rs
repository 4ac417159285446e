//! Local record and queue operation models.

use serde::{Deserialize, Serialize};

use super::EntityKind;

/// The next replay action implied by a record's pending state. A row can
/// accumulate multiple local edits but only ever carries one action label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingAction {
    Create,
    Update,
    Delete,
}

/// Kinds of staged mutations in the operation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    AdjustStock,
}

/// Cached copy of one remote entity row plus local sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    /// Surrogate key assigned by the local store; stable for the row's life.
    pub local_key: i64,
    pub entity: EntityKind,
    /// Null until the create operation has synced.
    pub remote_id: Option<String>,
    /// Parent/scope value extracted from the payload, if the entity is scoped.
    pub scope_key: Option<String>,
    /// Domain fields, entity-specific.
    pub fields: serde_json::Value,
    pub has_pending_writes: bool,
    pub pending_action: Option<PendingAction>,
    /// Milliseconds since epoch of the last local edit.
    pub last_local_change: Option<i64>,
    /// Last replay failure, cleared on the next successful replay.
    pub sync_error: Option<String>,
}

/// A staged mutation awaiting replay against the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOperation {
    /// Surrogate key; insertion order defines replay order.
    pub queue_id: i64,
    pub entity: EntityKind,
    pub operation_type: OperationType,
    pub target_local_key: i64,
    /// Null for creates until synced.
    pub target_remote_id: Option<String>,
    /// Sanitized domain fields to send.
    pub payload: serde_json::Value,
    /// Ledger row for compound operations.
    pub secondary_payload: Option<serde_json::Value>,
    /// Milliseconds since epoch; FIFO replay order.
    pub created_at: i64,
}

/// Identifies an existing local record by remote id, local key, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordIdentity {
    pub remote_id: Option<String>,
    pub local_key: Option<i64>,
}

impl RecordIdentity {
    pub fn remote(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: Some(remote_id.into()),
            local_key: None,
        }
    }

    pub fn local(local_key: i64) -> Self {
        Self {
            remote_id: None,
            local_key: Some(local_key),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remote_id.is_none() && self.local_key.is_none()
    }
}

impl std::fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.remote_id, self.local_key) {
            (Some(remote), Some(local)) => write!(f, "remote_id={remote} local_key={local}"),
            (Some(remote), None) => write!(f, "remote_id={remote}"),
            (None, Some(local)) => write!(f, "local_key={local}"),
            (None, None) => write!(f, "<empty identity>"),
        }
    }
}

/// Terminal state of one drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStatus {
    /// Queue fully replayed.
    Completed,
    /// Stopped at the first failing operation; the rest stay queued.
    Stopped,
    /// Skipped because the connectivity probe reported offline.
    Offline,
}

/// Result of draining one entity type's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainOutcome {
    pub status: DrainStatus,
    pub synced_count: usize,
    pub first_error: Option<String>,
}

impl DrainOutcome {
    pub fn offline() -> Self {
        Self {
            status: DrainStatus::Offline,
            synced_count: 0,
            first_error: None,
        }
    }
}

/// Result of a snapshot hydration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationOutcome {
    /// Number of remote rows applied to the local store.
    Applied(usize),
    /// Skipped because the connectivity probe reported offline; the local
    /// cache remains the read path.
    Offline,
}

impl PendingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingAction::Create => "create",
            PendingAction::Update => "update",
            PendingAction::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(PendingAction::Create),
            "update" => Some(PendingAction::Update),
            "delete" => Some(PendingAction::Delete),
            _ => None,
        }
    }
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::AdjustStock => "adjust_stock",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(OperationType::Create),
            "update" => Some(OperationType::Update),
            "delete" => Some(OperationType::Delete),
            "adjust_stock" => Some(OperationType::AdjustStock),
            _ => None,
        }
    }
}
