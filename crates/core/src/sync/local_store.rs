//! Port trait for the Local Record Store + Operation Queue.
//!
//! Implemented by `casework-storage-sqlite::CacheRepository`. Every staging
//! method writes the record table and the queue atomically; partial
//! application is never observable.

use async_trait::async_trait;

use crate::errors::Result;

use super::{EntityKind, LocalRecord, QueueOperation, RecordIdentity};

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Insert a new pending record and queue its `create` operation.
    /// Returns the assigned local key.
    async fn stage_create(&self, entity: EntityKind, payload: serde_json::Value) -> Result<i64>;

    /// Merge an edit into an existing record. Edits to an unsynced create are
    /// folded into the queued create's payload; edits to a remote-backed row
    /// append a new `update` operation (append-only, no coalescing).
    async fn stage_update(
        &self,
        entity: EntityKind,
        identity: RecordIdentity,
        payload: serde_json::Value,
    ) -> Result<i64>;

    /// Stage a delete. Local-only rows (no remote id) are removed together
    /// with their queued create immediately and never reach the network.
    async fn stage_delete(&self, entity: EntityKind, identity: RecordIdentity) -> Result<()>;

    /// Compound mutator: adjust a resource's stock and queue the matching
    /// ledger row. Fails with a validation error before writing anything if
    /// the resulting quantity would go negative.
    async fn stage_stock_adjustment(
        &self,
        entity: EntityKind,
        identity: RecordIdentity,
        delta: i64,
        note: Option<String>,
    ) -> Result<i64>;

    async fn get_record(
        &self,
        entity: EntityKind,
        identity: &RecordIdentity,
    ) -> Result<Option<LocalRecord>>;

    /// Ordered rows for an entity, optionally narrowed to one scope key.
    async fn list_records(
        &self,
        entity: EntityKind,
        scope: Option<&str>,
    ) -> Result<Vec<LocalRecord>>;

    /// Queued operations for an entity in FIFO replay order.
    async fn pending_operations(&self, entity: EntityKind) -> Result<Vec<QueueOperation>>;

    /// Number of queued operations, for UI badges.
    async fn pending_count(&self, entity: EntityKind) -> Result<i64>;

    /// Replace/merge the cache from a remote snapshot. Rows with pending
    /// writes are left untouched; full (unscoped) loads prune non-pending
    /// rows whose remote id no longer appears, scoped loads prune only
    /// within their scope. Returns the number of rows applied.
    async fn apply_remote_snapshot(
        &self,
        entity: EntityKind,
        rows: Vec<serde_json::Value>,
        scope: Option<String>,
    ) -> Result<usize>;

    /// Reconcile a successfully replayed operation: delete it from the queue
    /// and, when the server returned a row, fold its id and computed fields
    /// into the local record. Pending flags clear once no further operations
    /// target the record.
    async fn mark_operation_synced(
        &self,
        operation: &QueueOperation,
        remote_row: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Finish a replayed delete: remove the operation and the local record.
    async fn complete_delete(&self, operation: &QueueOperation) -> Result<()>;

    /// Record a replay failure on the target record; the operation stays
    /// queued.
    async fn record_sync_error(&self, operation: &QueueOperation, message: &str) -> Result<()>;

    /// Remove duplicate rows sharing a remote id, keeping the earliest local
    /// key. Idempotent. Returns the number of rows removed.
    async fn dedup_sweep(&self, entity: EntityKind) -> Result<usize>;
}
