//! Repository for the local record cache and operation queue.
//!
//! All mutations run on the write actor, so every staging call commits its
//! record write and queue write in one immediate transaction. Reads go to the
//! pool directly.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_json::Value;

use casework_core::errors::{Error, Result};
use casework_core::sync::{
    descriptor, sanitize_payload, CacheStore, EntityDescriptor, EntityKind, LocalRecord,
    OperationType, PendingAction, QueueOperation, RecordIdentity,
};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{local_records, queue_operations};

use super::model::{
    enum_to_db, LocalRecordDB, NewLocalRecordDB, NewQueueOperationDB, QueueOperationDB,
};
use super::subscription::{ChangeNotifier, RecordSubscription};

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn remote_id_of(row: &Value) -> Option<String> {
    match row.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn scope_of(d: &EntityDescriptor, payload: &Value) -> Option<String> {
    match payload.get(d.scope_field?) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn merge_into(base: &mut Value, patch: &Value) {
    if let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_obj {
            base_obj.insert(key.clone(), value.clone());
        }
    }
}

fn merge_payload_text(existing: &str, patch: &Value) -> Result<String> {
    let mut base: Value = serde_json::from_str(existing)?;
    merge_into(&mut base, patch);
    Ok(serde_json::to_string(&base)?)
}

fn load_record(
    conn: &mut SqliteConnection,
    entity_db: &str,
    identity: &RecordIdentity,
) -> Result<Option<LocalRecordDB>> {
    let mut query = local_records::table
        .filter(local_records::entity.eq(entity_db))
        .into_boxed();
    match (identity.local_key, identity.remote_id.as_deref()) {
        (Some(local_key), _) => query = query.filter(local_records::local_key.eq(local_key)),
        (None, Some(remote_id)) => query = query.filter(local_records::remote_id.eq(remote_id)),
        (None, None) => return Ok(None),
    }
    Ok(query
        .first::<LocalRecordDB>(conn)
        .optional()
        .map_err(StorageError::from)?)
}

fn require_record(
    conn: &mut SqliteConnection,
    entity: EntityKind,
    entity_db: &str,
    identity: &RecordIdentity,
) -> Result<LocalRecordDB> {
    load_record(conn, entity_db, identity)?.ok_or_else(|| {
        Error::not_found(format!(
            "No {} record matches {}",
            entity.as_str(),
            identity
        ))
    })
}

fn find_queued_create(
    conn: &mut SqliteConnection,
    local_key: i64,
) -> Result<Option<QueueOperationDB>> {
    Ok(queue_operations::table
        .filter(queue_operations::target_local_key.eq(local_key))
        .filter(queue_operations::operation_type.eq(OperationType::Create.as_str()))
        .first::<QueueOperationDB>(conn)
        .optional()
        .map_err(StorageError::from)?)
}

fn insert_operation(conn: &mut SqliteConnection, op: &NewQueueOperationDB) -> Result<()> {
    diesel::insert_into(queue_operations::table)
        .values(op)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

pub struct CacheRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
    notifier: ChangeNotifier,
}

impl CacheRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self {
            pool,
            writer,
            notifier: ChangeNotifier::new(),
        }
    }

    pub fn notifier(&self) -> ChangeNotifier {
        self.notifier.clone()
    }

    /// Live view over one entity's cached rows, optionally narrowed to a
    /// scope key. Emits the current snapshot first, then reloads after each
    /// local change to that entity.
    pub fn subscribe(
        self: &Arc<Self>,
        entity: EntityKind,
        scope: Option<String>,
    ) -> RecordSubscription {
        RecordSubscription::new(Arc::clone(self), entity, scope)
    }
}

#[async_trait]
impl CacheStore for CacheRepository {
    async fn stage_create(&self, entity: EntityKind, payload: Value) -> Result<i64> {
        let d = descriptor(entity);
        let sanitized = sanitize_payload(d, &payload)?;
        let scope_key = scope_of(d, &sanitized);
        let entity_db = enum_to_db(&entity)?;

        let local_key = self
            .writer
            .exec(move |conn| {
                let now = now_millis();
                let payload_text = serde_json::to_string(&sanitized)?;
                let record = NewLocalRecordDB {
                    entity: entity_db.clone(),
                    remote_id: None,
                    scope_key,
                    payload: payload_text.clone(),
                    has_pending_writes: 1,
                    pending_action: Some(PendingAction::Create.as_str().to_string()),
                    last_local_change: Some(now),
                    sync_error: None,
                };
                let local_key = diesel::insert_into(local_records::table)
                    .values(&record)
                    .returning(local_records::local_key)
                    .get_result::<i64>(conn)
                    .map_err(StorageError::from)?;

                insert_operation(
                    conn,
                    &NewQueueOperationDB {
                        entity: entity_db,
                        operation_type: OperationType::Create.as_str().to_string(),
                        target_local_key: local_key,
                        target_remote_id: None,
                        payload: payload_text,
                        secondary_payload: None,
                        created_at: now,
                    },
                )?;
                Ok(local_key)
            })
            .await?;

        self.notifier.notify(entity);
        Ok(local_key)
    }

    async fn stage_update(
        &self,
        entity: EntityKind,
        identity: RecordIdentity,
        payload: Value,
    ) -> Result<i64> {
        let d = descriptor(entity);
        let sanitized = sanitize_payload(d, &payload)?;
        let entity_db = enum_to_db(&entity)?;

        let local_key = self
            .writer
            .exec(move |conn| {
                let record = require_record(conn, entity, &entity_db, &identity)?;
                if record.pending_action.as_deref() == Some(PendingAction::Delete.as_str()) {
                    return Err(Error::validation(format!(
                        "{} record {} is pending deletion",
                        entity.as_str(),
                        identity
                    )));
                }

                let now = now_millis();
                let merged = merge_payload_text(&record.payload, &sanitized)?;

                if record.pending_action.as_deref() == Some(PendingAction::Create.as_str()) {
                    // Unsynced row: fold the edit into the queued create so
                    // replay stays a single insert.
                    diesel::update(local_records::table.find(record.local_key))
                        .set((
                            local_records::payload.eq(&merged),
                            local_records::has_pending_writes.eq(1),
                            local_records::last_local_change.eq(Some(now)),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?;

                    if let Some(create_op) = find_queued_create(conn, record.local_key)? {
                        let op_payload = merge_payload_text(&create_op.payload, &sanitized)?;
                        diesel::update(queue_operations::table.find(create_op.queue_id))
                            .set(queue_operations::payload.eq(op_payload))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                    }
                } else {
                    diesel::update(local_records::table.find(record.local_key))
                        .set((
                            local_records::payload.eq(&merged),
                            local_records::has_pending_writes.eq(1),
                            local_records::pending_action
                                .eq(Some(PendingAction::Update.as_str())),
                            local_records::last_local_change.eq(Some(now)),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?;

                    insert_operation(
                        conn,
                        &NewQueueOperationDB {
                            entity: entity_db,
                            operation_type: OperationType::Update.as_str().to_string(),
                            target_local_key: record.local_key,
                            target_remote_id: record.remote_id.clone(),
                            payload: serde_json::to_string(&sanitized)?,
                            secondary_payload: None,
                            created_at: now,
                        },
                    )?;
                }
                Ok(record.local_key)
            })
            .await?;

        self.notifier.notify(entity);
        Ok(local_key)
    }

    async fn stage_delete(&self, entity: EntityKind, identity: RecordIdentity) -> Result<()> {
        let entity_db = enum_to_db(&entity)?;

        self.writer
            .exec(move |conn| {
                let record = require_record(conn, entity, &entity_db, &identity)?;
                let now = now_millis();

                match &record.remote_id {
                    // Never synced: drop the row and its queued create; the
                    // server never hears about it.
                    None => {
                        diesel::delete(
                            queue_operations::table
                                .filter(queue_operations::target_local_key.eq(record.local_key)),
                        )
                        .execute(conn)
                        .map_err(StorageError::from)?;
                        diesel::delete(local_records::table.find(record.local_key))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                    }
                    Some(remote_id) => {
                        diesel::update(local_records::table.find(record.local_key))
                            .set((
                                local_records::has_pending_writes.eq(1),
                                local_records::pending_action
                                    .eq(Some(PendingAction::Delete.as_str())),
                                local_records::last_local_change.eq(Some(now)),
                            ))
                            .execute(conn)
                            .map_err(StorageError::from)?;

                        insert_operation(
                            conn,
                            &NewQueueOperationDB {
                                entity: entity_db,
                                operation_type: OperationType::Delete.as_str().to_string(),
                                target_local_key: record.local_key,
                                target_remote_id: Some(remote_id.clone()),
                                payload: "{}".to_string(),
                                secondary_payload: None,
                                created_at: now,
                            },
                        )?;
                    }
                }
                Ok(())
            })
            .await?;

        self.notifier.notify(entity);
        Ok(())
    }

    async fn stage_stock_adjustment(
        &self,
        entity: EntityKind,
        identity: RecordIdentity,
        delta: i64,
        note: Option<String>,
    ) -> Result<i64> {
        let entity_db = enum_to_db(&entity)?;

        let local_key = self
            .writer
            .exec(move |conn| {
                let record = require_record(conn, entity, &entity_db, &identity)?;
                if record.pending_action.as_deref() == Some(PendingAction::Delete.as_str()) {
                    return Err(Error::validation(format!(
                        "{} record {} is pending deletion",
                        entity.as_str(),
                        identity
                    )));
                }

                let now = now_millis();
                let mut fields: Value = serde_json::from_str(&record.payload)?;
                let current = fields
                    .get("current_stock")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let next = current + delta;
                // Returning Err rolls the transaction back, so a rejected
                // adjustment writes nothing.
                if next < 0 {
                    return Err(Error::validation(format!(
                        "Stock for {} {} cannot go below zero (current {}, delta {})",
                        entity.as_str(),
                        identity,
                        current,
                        delta
                    )));
                }

                let patch = serde_json::json!({ "current_stock": next });
                merge_into(&mut fields, &patch);
                let merged = serde_json::to_string(&fields)?;

                if record.pending_action.as_deref() == Some(PendingAction::Create.as_str()) {
                    // Unsynced resource: the adjusted quantity rides along in
                    // the queued create; no ledger row is staged.
                    diesel::update(local_records::table.find(record.local_key))
                        .set((
                            local_records::payload.eq(&merged),
                            local_records::last_local_change.eq(Some(now)),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?;

                    if let Some(create_op) = find_queued_create(conn, record.local_key)? {
                        let op_payload = merge_payload_text(&create_op.payload, &patch)?;
                        diesel::update(queue_operations::table.find(create_op.queue_id))
                            .set(queue_operations::payload.eq(op_payload))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                    }
                } else {
                    diesel::update(local_records::table.find(record.local_key))
                        .set((
                            local_records::payload.eq(&merged),
                            local_records::has_pending_writes.eq(1),
                            local_records::pending_action
                                .eq(Some(PendingAction::Update.as_str())),
                            local_records::last_local_change.eq(Some(now)),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?;

                    let secondary = serde_json::json!({
                        "delta": delta,
                        "note": note,
                        "created_at": now,
                    });
                    insert_operation(
                        conn,
                        &NewQueueOperationDB {
                            entity: entity_db,
                            operation_type: OperationType::AdjustStock.as_str().to_string(),
                            target_local_key: record.local_key,
                            target_remote_id: record.remote_id.clone(),
                            payload: serde_json::to_string(&patch)?,
                            secondary_payload: Some(serde_json::to_string(&secondary)?),
                            created_at: now,
                        },
                    )?;
                }
                Ok(record.local_key)
            })
            .await?;

        self.notifier.notify(entity);
        Ok(local_key)
    }

    async fn get_record(
        &self,
        entity: EntityKind,
        identity: &RecordIdentity,
    ) -> Result<Option<LocalRecord>> {
        let entity_db = enum_to_db(&entity)?;
        let mut conn = get_connection(&self.pool)?;
        load_record(&mut conn, &entity_db, identity)?
            .map(LocalRecordDB::into_domain)
            .transpose()
    }

    async fn list_records(
        &self,
        entity: EntityKind,
        scope: Option<&str>,
    ) -> Result<Vec<LocalRecord>> {
        let entity_db = enum_to_db(&entity)?;
        let mut conn = get_connection(&self.pool)?;
        let mut query = local_records::table
            .filter(local_records::entity.eq(&entity_db))
            .order(local_records::local_key.asc())
            .into_boxed();
        if let Some(scope) = scope {
            query = query.filter(local_records::scope_key.eq(scope));
        }
        let rows = query
            .load::<LocalRecordDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(LocalRecordDB::into_domain).collect()
    }

    async fn pending_operations(&self, entity: EntityKind) -> Result<Vec<QueueOperation>> {
        let entity_db = enum_to_db(&entity)?;
        let mut conn = get_connection(&self.pool)?;
        let rows = queue_operations::table
            .filter(queue_operations::entity.eq(&entity_db))
            .order((
                queue_operations::created_at.asc(),
                queue_operations::queue_id.asc(),
            ))
            .load::<QueueOperationDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(QueueOperationDB::into_domain).collect()
    }

    async fn pending_count(&self, entity: EntityKind) -> Result<i64> {
        let entity_db = enum_to_db(&entity)?;
        let mut conn = get_connection(&self.pool)?;
        Ok(queue_operations::table
            .filter(queue_operations::entity.eq(&entity_db))
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?)
    }

    async fn apply_remote_snapshot(
        &self,
        entity: EntityKind,
        rows: Vec<Value>,
        scope: Option<String>,
    ) -> Result<usize> {
        let d = descriptor(entity);
        let entity_db = enum_to_db(&entity)?;

        let applied = self
            .writer
            .exec(move |conn| {
                let mut seen: HashSet<String> = HashSet::with_capacity(rows.len());
                let mut applied = 0usize;

                for row in rows {
                    let Some(remote_id) = remote_id_of(&row) else {
                        continue;
                    };
                    seen.insert(remote_id.clone());
                    let scope_key = scope_of(d, &row);
                    let payload_text = serde_json::to_string(&row)?;

                    let existing = local_records::table
                        .filter(local_records::entity.eq(&entity_db))
                        .filter(local_records::remote_id.eq(remote_id.as_str()))
                        .first::<LocalRecordDB>(conn)
                        .optional()
                        .map_err(StorageError::from)?;

                    match existing {
                        // Pending local edits win until their replay settles.
                        Some(record) if record.has_pending_writes != 0 => continue,
                        Some(record) => {
                            diesel::update(local_records::table.find(record.local_key))
                                .set((
                                    local_records::payload.eq(&payload_text),
                                    local_records::scope_key.eq(scope_key.clone()),
                                    local_records::pending_action
                                        .eq::<Option<String>>(None),
                                    local_records::sync_error.eq::<Option<String>>(None),
                                ))
                                .execute(conn)
                                .map_err(StorageError::from)?;
                            applied += 1;
                        }
                        None => {
                            diesel::insert_into(local_records::table)
                                .values(&NewLocalRecordDB {
                                    entity: entity_db.clone(),
                                    remote_id: Some(remote_id),
                                    scope_key,
                                    payload: payload_text,
                                    has_pending_writes: 0,
                                    pending_action: None,
                                    last_local_change: None,
                                    sync_error: None,
                                })
                                .execute(conn)
                                .map_err(StorageError::from)?;
                            applied += 1;
                        }
                    }
                }

                // Prune synced rows the snapshot no longer contains. Scoped
                // loads only prune within their scope.
                let mut candidates = local_records::table
                    .filter(local_records::entity.eq(&entity_db))
                    .filter(local_records::has_pending_writes.eq(0))
                    .filter(local_records::remote_id.is_not_null())
                    .into_boxed();
                if let Some(scope_value) = &scope {
                    candidates =
                        candidates.filter(local_records::scope_key.eq(scope_value.as_str()));
                }
                let doomed: Vec<i64> = candidates
                    .load::<LocalRecordDB>(conn)
                    .map_err(StorageError::from)?
                    .into_iter()
                    .filter(|record| {
                        record
                            .remote_id
                            .as_ref()
                            .is_some_and(|id| !seen.contains(id))
                    })
                    .map(|record| record.local_key)
                    .collect();
                if !doomed.is_empty() {
                    diesel::delete(
                        local_records::table.filter(local_records::local_key.eq_any(&doomed)),
                    )
                    .execute(conn)
                    .map_err(StorageError::from)?;
                }

                Ok(applied)
            })
            .await?;

        self.notifier.notify(entity);
        Ok(applied)
    }

    async fn mark_operation_synced(
        &self,
        operation: &QueueOperation,
        remote_row: Option<Value>,
    ) -> Result<()> {
        let d = descriptor(operation.entity);
        let entity = operation.entity;
        let operation = operation.clone();

        self.writer
            .exec(move |conn| {
                diesel::delete(queue_operations::table.find(operation.queue_id))
                    .execute(conn)
                    .map_err(StorageError::from)?;

                if let Some(row) = &remote_row {
                    let record = local_records::table
                        .find(operation.target_local_key)
                        .first::<LocalRecordDB>(conn)
                        .optional()
                        .map_err(StorageError::from)?;
                    if let Some(record) = record {
                        let mut fields: Value = serde_json::from_str(&record.payload)?;
                        merge_into(&mut fields, row);
                        let adopted_id = remote_id_of(row).or(record.remote_id);
                        let scope_key = scope_of(d, &fields);

                        diesel::update(local_records::table.find(record.local_key))
                            .set((
                                local_records::payload.eq(serde_json::to_string(&fields)?),
                                local_records::remote_id.eq(adopted_id.clone()),
                                local_records::scope_key.eq(scope_key),
                            ))
                            .execute(conn)
                            .map_err(StorageError::from)?;

                        if let Some(remote_id) = adopted_id {
                            diesel::update(
                                queue_operations::table
                                    .filter(
                                        queue_operations::target_local_key
                                            .eq(operation.target_local_key),
                                    )
                                    .filter(queue_operations::target_remote_id.is_null()),
                            )
                            .set(queue_operations::target_remote_id.eq(remote_id))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                        }
                    }
                }

                let remaining: i64 = queue_operations::table
                    .filter(queue_operations::target_local_key.eq(operation.target_local_key))
                    .count()
                    .get_result(conn)
                    .map_err(StorageError::from)?;
                if remaining == 0 {
                    diesel::update(local_records::table.find(operation.target_local_key))
                        .set((
                            local_records::has_pending_writes.eq(0),
                            local_records::pending_action.eq::<Option<String>>(None),
                            local_records::sync_error.eq::<Option<String>>(None),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                }
                Ok(())
            })
            .await?;

        self.notifier.notify(entity);
        Ok(())
    }

    async fn complete_delete(&self, operation: &QueueOperation) -> Result<()> {
        let entity = operation.entity;
        let queue_id = operation.queue_id;
        let target_local_key = operation.target_local_key;

        self.writer
            .exec(move |conn| {
                diesel::delete(queue_operations::table.find(queue_id))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                diesel::delete(local_records::table.find(target_local_key))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await?;

        self.notifier.notify(entity);
        Ok(())
    }

    async fn record_sync_error(&self, operation: &QueueOperation, message: &str) -> Result<()> {
        let entity = operation.entity;
        let target_local_key = operation.target_local_key;
        let message = message.to_string();

        self.writer
            .exec(move |conn| {
                diesel::update(local_records::table.find(target_local_key))
                    .set(local_records::sync_error.eq(Some(message)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await?;

        self.notifier.notify(entity);
        Ok(())
    }

    async fn dedup_sweep(&self, entity: EntityKind) -> Result<usize> {
        let entity_db = enum_to_db(&entity)?;

        let removed = self
            .writer
            .exec(move |conn| {
                let rows = local_records::table
                    .filter(local_records::entity.eq(&entity_db))
                    .filter(local_records::remote_id.is_not_null())
                    .order(local_records::local_key.asc())
                    .load::<LocalRecordDB>(conn)
                    .map_err(StorageError::from)?;

                let mut seen: HashSet<String> = HashSet::new();
                let mut doomed: Vec<i64> = Vec::new();
                for record in rows {
                    if let Some(remote_id) = record.remote_id {
                        // Duplicates with un-replayed local edits are left for
                        // a later sweep; dropping them here would discard the
                        // edits and their queued operations.
                        if !seen.insert(remote_id) && record.has_pending_writes == 0 {
                            doomed.push(record.local_key);
                        }
                    }
                }

                if !doomed.is_empty() {
                    diesel::delete(
                        queue_operations::table
                            .filter(queue_operations::target_local_key.eq_any(&doomed)),
                    )
                    .execute(conn)
                    .map_err(StorageError::from)?;
                    diesel::delete(
                        local_records::table.filter(local_records::local_key.eq_any(&doomed)),
                    )
                    .execute(conn)
                    .map_err(StorageError::from)?;
                }
                Ok(doomed.len())
            })
            .await?;

        if removed > 0 {
            self.notifier.notify(entity);
        }
        Ok(removed)
    }
}
