//! Diesel row models for the cache tables and their domain conversions.

use diesel::prelude::*;

use casework_core::errors::{DatabaseError, Error, Result};
use casework_core::sync::{
    EntityKind, LocalRecord, OperationType, PendingAction, QueueOperation,
};

use crate::schema::{local_records, queue_operations};

pub fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = local_records, primary_key(local_key))]
pub struct LocalRecordDB {
    pub local_key: i64,
    pub entity: String,
    pub remote_id: Option<String>,
    pub scope_key: Option<String>,
    pub payload: String,
    pub has_pending_writes: i32,
    pub pending_action: Option<String>,
    pub last_local_change: Option<i64>,
    pub sync_error: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = local_records)]
pub struct NewLocalRecordDB {
    pub entity: String,
    pub remote_id: Option<String>,
    pub scope_key: Option<String>,
    pub payload: String,
    pub has_pending_writes: i32,
    pub pending_action: Option<String>,
    pub last_local_change: Option<i64>,
    pub sync_error: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = queue_operations, primary_key(queue_id))]
pub struct QueueOperationDB {
    pub queue_id: i64,
    pub entity: String,
    pub operation_type: String,
    pub target_local_key: i64,
    pub target_remote_id: Option<String>,
    pub payload: String,
    pub secondary_payload: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = queue_operations)]
pub struct NewQueueOperationDB {
    pub entity: String,
    pub operation_type: String,
    pub target_local_key: i64,
    pub target_remote_id: Option<String>,
    pub payload: String,
    pub secondary_payload: Option<String>,
    pub created_at: i64,
}

impl LocalRecordDB {
    pub fn into_domain(self) -> Result<LocalRecord> {
        let entity: EntityKind = enum_from_db(&self.entity)?;
        let pending_action = self
            .pending_action
            .as_deref()
            .map(|value| {
                PendingAction::parse(value).ok_or_else(|| {
                    Error::Database(DatabaseError::Internal(format!(
                        "Unknown pending action '{}'",
                        value
                    )))
                })
            })
            .transpose()?;
        Ok(LocalRecord {
            local_key: self.local_key,
            entity,
            remote_id: self.remote_id,
            scope_key: self.scope_key,
            fields: serde_json::from_str(&self.payload)?,
            has_pending_writes: self.has_pending_writes != 0,
            pending_action,
            last_local_change: self.last_local_change,
            sync_error: self.sync_error,
        })
    }
}

impl QueueOperationDB {
    pub fn into_domain(self) -> Result<QueueOperation> {
        let entity: EntityKind = enum_from_db(&self.entity)?;
        let operation_type = OperationType::parse(&self.operation_type).ok_or_else(|| {
            Error::Database(DatabaseError::Internal(format!(
                "Unknown operation type '{}'",
                self.operation_type
            )))
        })?;
        let secondary_payload = self
            .secondary_payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(QueueOperation {
            queue_id: self.queue_id,
            entity,
            operation_type,
            target_local_key: self.target_local_key,
            target_remote_id: self.target_remote_id,
            payload: serde_json::from_str(&self.payload)?,
            secondary_payload,
            created_at: self.created_at,
        })
    }
}
