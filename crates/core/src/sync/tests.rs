//! Synchronizer and hydrator tests against in-memory fakes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::errors::{Error, RemoteError, Result};
use crate::sync::*;

fn remote_id_of(row: &Value) -> Option<String> {
    match row.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn merge_fields(base: &mut Value, patch: &Value) {
    if let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_obj {
            base_obj.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<LocalRecord>,
    operations: Vec<QueueOperation>,
    next_local_key: i64,
    next_queue_id: i64,
    clock: i64,
}

/// In-memory `CacheStore` mirroring the sqlite repository's semantics.
#[derive(Default)]
struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    fn records(&self) -> Vec<LocalRecord> {
        self.state.lock().unwrap().records.clone()
    }

    fn operations(&self) -> Vec<QueueOperation> {
        self.state.lock().unwrap().operations.clone()
    }

    fn push_record(&self, entity: EntityKind, remote_id: Option<&str>, fields: Value) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_local_key += 1;
        let local_key = state.next_local_key;
        state.records.push(LocalRecord {
            local_key,
            entity,
            remote_id: remote_id.map(String::from),
            scope_key: None,
            fields,
            has_pending_writes: false,
            pending_action: None,
            last_local_change: None,
            sync_error: None,
        });
        local_key
    }

    fn push_operation(
        &self,
        entity: EntityKind,
        operation_type: OperationType,
        target_local_key: i64,
        target_remote_id: Option<&str>,
        payload: Value,
        secondary_payload: Option<Value>,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_queue_id += 1;
        state.clock += 1;
        let queue_id = state.next_queue_id;
        let created_at = state.clock;
        state.operations.push(QueueOperation {
            queue_id,
            entity,
            operation_type,
            target_local_key,
            target_remote_id: target_remote_id.map(String::from),
            payload,
            secondary_payload,
            created_at,
        });
        queue_id
    }

    fn mark_pending(&self, local_key: i64, action: PendingAction) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.iter_mut().find(|r| r.local_key == local_key) {
            record.has_pending_writes = true;
            record.pending_action = Some(action);
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn stage_create(&self, entity: EntityKind, payload: Value) -> Result<i64> {
        let sanitized = sanitize_payload(descriptor(entity), &payload)?;
        let mut state = self.state.lock().unwrap();
        state.next_local_key += 1;
        state.next_queue_id += 1;
        state.clock += 1;
        let local_key = state.next_local_key;
        let queue_id = state.next_queue_id;
        let now = state.clock;
        state.records.push(LocalRecord {
            local_key,
            entity,
            remote_id: None,
            scope_key: None,
            fields: sanitized.clone(),
            has_pending_writes: true,
            pending_action: Some(PendingAction::Create),
            last_local_change: Some(now),
            sync_error: None,
        });
        state.operations.push(QueueOperation {
            queue_id,
            entity,
            operation_type: OperationType::Create,
            target_local_key: local_key,
            target_remote_id: None,
            payload: sanitized,
            secondary_payload: None,
            created_at: now,
        });
        Ok(local_key)
    }

    async fn stage_update(
        &self,
        entity: EntityKind,
        identity: RecordIdentity,
        payload: Value,
    ) -> Result<i64> {
        let sanitized = sanitize_payload(descriptor(entity), &payload)?;
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let now = state.clock;
        let record = state
            .records
            .iter_mut()
            .find(|r| {
                r.entity == entity
                    && (identity.local_key == Some(r.local_key)
                        || (identity.remote_id.is_some() && identity.remote_id == r.remote_id))
            })
            .ok_or_else(|| Error::not_found(format!("no {} record", entity.as_str())))?;
        merge_fields(&mut record.fields, &sanitized);
        record.has_pending_writes = true;
        record.last_local_change = Some(now);
        let local_key = record.local_key;
        let remote_id = record.remote_id.clone();

        if record.pending_action == Some(PendingAction::Create) {
            if let Some(op) = state.operations.iter_mut().find(|op| {
                op.target_local_key == local_key && op.operation_type == OperationType::Create
            }) {
                merge_fields(&mut op.payload, &sanitized);
            }
        } else {
            if let Some(record) = state.records.iter_mut().find(|r| r.local_key == local_key) {
                record.pending_action = Some(PendingAction::Update);
            }
            state.next_queue_id += 1;
            let queue_id = state.next_queue_id;
            state.operations.push(QueueOperation {
                queue_id,
                entity,
                operation_type: OperationType::Update,
                target_local_key: local_key,
                target_remote_id: remote_id,
                payload: sanitized,
                secondary_payload: None,
                created_at: now,
            });
        }
        Ok(local_key)
    }

    async fn stage_delete(&self, entity: EntityKind, identity: RecordIdentity) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let now = state.clock;
        let position = state
            .records
            .iter()
            .position(|r| {
                r.entity == entity
                    && (identity.local_key == Some(r.local_key)
                        || (identity.remote_id.is_some() && identity.remote_id == r.remote_id))
            })
            .ok_or_else(|| Error::not_found(format!("no {} record", entity.as_str())))?;
        let local_key = state.records[position].local_key;
        let remote_id = state.records[position].remote_id.clone();

        match remote_id {
            None => {
                state.records.remove(position);
                state.operations.retain(|op| op.target_local_key != local_key);
            }
            Some(remote_id) => {
                let record = &mut state.records[position];
                record.has_pending_writes = true;
                record.pending_action = Some(PendingAction::Delete);
                record.last_local_change = Some(now);
                state.next_queue_id += 1;
                let queue_id = state.next_queue_id;
                state.operations.push(QueueOperation {
                    queue_id,
                    entity,
                    operation_type: OperationType::Delete,
                    target_local_key: local_key,
                    target_remote_id: Some(remote_id),
                    payload: json!({}),
                    secondary_payload: None,
                    created_at: now,
                });
            }
        }
        Ok(())
    }

    async fn stage_stock_adjustment(
        &self,
        entity: EntityKind,
        identity: RecordIdentity,
        delta: i64,
        note: Option<String>,
    ) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let now = state.clock;
        let record = state
            .records
            .iter_mut()
            .find(|r| {
                r.entity == entity
                    && (identity.local_key == Some(r.local_key)
                        || (identity.remote_id.is_some() && identity.remote_id == r.remote_id))
            })
            .ok_or_else(|| Error::not_found(format!("no {} record", entity.as_str())))?;
        let current = record.fields.get("current_stock").and_then(Value::as_i64).unwrap_or(0);
        let next = current + delta;
        if next < 0 {
            return Err(Error::validation("stock cannot go negative"));
        }
        merge_fields(&mut record.fields, &json!({ "current_stock": next }));
        record.has_pending_writes = true;
        record.pending_action = Some(PendingAction::Update);
        record.last_local_change = Some(now);
        let local_key = record.local_key;
        let remote_id = record.remote_id.clone();

        state.next_queue_id += 1;
        let queue_id = state.next_queue_id;
        state.operations.push(QueueOperation {
            queue_id,
            entity,
            operation_type: OperationType::AdjustStock,
            target_local_key: local_key,
            target_remote_id: remote_id,
            payload: json!({ "current_stock": next }),
            secondary_payload: Some(json!({ "delta": delta, "note": note, "created_at": now })),
            created_at: now,
        });
        Ok(local_key)
    }

    async fn get_record(
        &self,
        entity: EntityKind,
        identity: &RecordIdentity,
    ) -> Result<Option<LocalRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .find(|r| {
                r.entity == entity
                    && (identity.local_key == Some(r.local_key)
                        || (identity.remote_id.is_some() && identity.remote_id == r.remote_id))
            })
            .cloned())
    }

    async fn list_records(
        &self,
        entity: EntityKind,
        scope: Option<&str>,
    ) -> Result<Vec<LocalRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|r| r.entity == entity && scope.map_or(true, |s| r.scope_key.as_deref() == Some(s)))
            .cloned()
            .collect())
    }

    async fn pending_operations(&self, entity: EntityKind) -> Result<Vec<QueueOperation>> {
        let state = self.state.lock().unwrap();
        let mut ops: Vec<_> = state
            .operations
            .iter()
            .filter(|op| op.entity == entity)
            .cloned()
            .collect();
        ops.sort_by_key(|op| (op.created_at, op.queue_id));
        Ok(ops)
    }

    async fn pending_count(&self, entity: EntityKind) -> Result<i64> {
        Ok(self.pending_operations(entity).await?.len() as i64)
    }

    async fn apply_remote_snapshot(
        &self,
        entity: EntityKind,
        rows: Vec<Value>,
        scope: Option<String>,
    ) -> Result<usize> {
        let d = descriptor(entity);
        let mut state = self.state.lock().unwrap();
        let mut seen = HashSet::new();
        let mut applied = 0usize;
        for row in rows {
            let Some(remote_id) = remote_id_of(&row) else {
                continue;
            };
            seen.insert(remote_id.clone());
            let scope_key = d
                .scope_field
                .and_then(|f| row.get(f))
                .and_then(Value::as_str)
                .map(String::from);
            match state
                .records
                .iter_mut()
                .find(|r| r.entity == entity && r.remote_id.as_deref() == Some(&remote_id))
            {
                Some(record) if record.has_pending_writes => continue,
                Some(record) => {
                    record.fields = row;
                    record.scope_key = scope_key;
                    record.pending_action = None;
                    record.sync_error = None;
                    applied += 1;
                }
                None => {
                    state.next_local_key += 1;
                    let local_key = state.next_local_key;
                    state.records.push(LocalRecord {
                        local_key,
                        entity,
                        remote_id: Some(remote_id),
                        scope_key,
                        fields: row,
                        has_pending_writes: false,
                        pending_action: None,
                        last_local_change: None,
                        sync_error: None,
                    });
                    applied += 1;
                }
            }
        }
        state.records.retain(|r| {
            if r.entity != entity || r.has_pending_writes {
                return true;
            }
            let Some(remote_id) = &r.remote_id else {
                return true;
            };
            if let Some(scope_value) = &scope {
                if r.scope_key.as_deref() != Some(scope_value.as_str()) {
                    return true;
                }
            }
            seen.contains(remote_id)
        });
        Ok(applied)
    }

    async fn mark_operation_synced(
        &self,
        operation: &QueueOperation,
        remote_row: Option<Value>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.operations.retain(|op| op.queue_id != operation.queue_id);
        let remaining = state
            .operations
            .iter()
            .any(|op| op.target_local_key == operation.target_local_key);
        if let Some(record) = state
            .records
            .iter_mut()
            .find(|r| r.local_key == operation.target_local_key)
        {
            if let Some(row) = &remote_row {
                merge_fields(&mut record.fields, row);
                if let Some(remote_id) = remote_id_of(row) {
                    record.remote_id = Some(remote_id);
                }
            }
            if !remaining {
                record.has_pending_writes = false;
                record.pending_action = None;
                record.sync_error = None;
            }
        }
        Ok(())
    }

    async fn complete_delete(&self, operation: &QueueOperation) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.operations.retain(|op| op.queue_id != operation.queue_id);
        state
            .records
            .retain(|r| r.local_key != operation.target_local_key);
        Ok(())
    }

    async fn record_sync_error(&self, operation: &QueueOperation, message: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state
            .records
            .iter_mut()
            .find(|r| r.local_key == operation.target_local_key)
        {
            record.sync_error = Some(message.to_string());
        }
        Ok(())
    }

    async fn dedup_sweep(&self, entity: EntityKind) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let mut kept: HashMap<String, i64> = HashMap::new();
        for record in state.records.iter().filter(|r| r.entity == entity) {
            if let Some(remote_id) = &record.remote_id {
                let entry = kept.entry(remote_id.clone()).or_insert(record.local_key);
                if record.local_key < *entry {
                    *entry = record.local_key;
                }
            }
        }
        let before = state.records.len();
        let doomed: Vec<i64> = state
            .records
            .iter()
            .filter(|r| r.entity == entity && !r.has_pending_writes)
            .filter(|r| {
                r.remote_id
                    .as_ref()
                    .is_some_and(|id| kept.get(id) != Some(&r.local_key))
            })
            .map(|r| r.local_key)
            .collect();
        state.records.retain(|r| !doomed.contains(&r.local_key));
        state
            .operations
            .retain(|op| !doomed.contains(&op.target_local_key));
        Ok(before - state.records.len())
    }
}

#[derive(Debug, Clone)]
struct RemoteCall {
    method: &'static str,
    table: String,
    payload: Value,
}

#[derive(Default)]
struct FakeRemoteState {
    tables: HashMap<String, Vec<Value>>,
    calls: Vec<RemoteCall>,
    scripted_errors: HashMap<&'static str, VecDeque<RemoteError>>,
    next_id: u64,
}

#[derive(Default)]
struct FakeRemote {
    state: Mutex<FakeRemoteState>,
    insert_delay: Option<Duration>,
}

impl FakeRemote {
    fn seed_row(&self, table: &str, row: Value) {
        let mut state = self.state.lock().unwrap();
        state.tables.entry(table.to_string()).or_default().push(row);
    }

    fn script_error(&self, method: &'static str, error: RemoteError) {
        let mut state = self.state.lock().unwrap();
        state
            .scripted_errors
            .entry(method)
            .or_default()
            .push_back(error);
    }

    fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().unwrap().calls.clone()
    }

    fn rows(&self, table: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn take_scripted(&self, method: &'static str) -> Option<RemoteError> {
        self.state
            .lock()
            .unwrap()
            .scripted_errors
            .get_mut(method)
            .and_then(VecDeque::pop_front)
    }

    fn record_call(&self, method: &'static str, table: &str, payload: Value) {
        self.state.lock().unwrap().calls.push(RemoteCall {
            method,
            table: table.to_string(),
            payload,
        });
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn select(
        &self,
        table: &str,
        filters: &[RemoteFilter],
        _order: Option<&RemoteOrder>,
    ) -> std::result::Result<Vec<Value>, RemoteError> {
        self.record_call("select", table, json!({}));
        if let Some(err) = self.take_scripted("select") {
            return Err(err);
        }
        let rows = self.rows(table);
        Ok(rows
            .into_iter()
            .filter(|row| {
                filters
                    .iter()
                    .all(|f| row.get(&f.field) == Some(&f.value))
            })
            .collect())
    }

    async fn insert(
        &self,
        table: &str,
        row: Value,
    ) -> std::result::Result<Value, RemoteError> {
        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }
        self.record_call("insert", table, row.clone());
        if let Some(err) = self.take_scripted("insert") {
            return Err(err);
        }
        let mut stored = row;
        let mut state = self.state.lock().unwrap();
        if stored.get("id").is_none() {
            state.next_id += 1;
            let id = format!("srv-{}", state.next_id);
            stored
                .as_object_mut()
                .expect("insert payload is an object")
                .insert("id".to_string(), Value::String(id));
        }
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Value,
    ) -> std::result::Result<Value, RemoteError> {
        self.record_call("update", table, patch.clone());
        if let Some(err) = self.take_scripted("update") {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        let rows = state.tables.entry(table.to_string()).or_default();
        let row = rows
            .iter_mut()
            .find(|row| remote_id_of(row).as_deref() == Some(id))
            .ok_or_else(|| RemoteError::api(404, format!("no row {id}")).with_code("PGRST116"))?;
        merge_fields(row, &patch);
        Ok(row.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> std::result::Result<(), RemoteError> {
        self.record_call("delete", table, json!({ "id": id }));
        if let Some(err) = self.take_scripted("delete") {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        let rows = state.tables.entry(table.to_string()).or_default();
        let before = rows.len();
        rows.retain(|row| remote_id_of(row).as_deref() != Some(id));
        if rows.len() == before {
            return Err(RemoteError::api(404, format!("no row {id}")).with_code("PGRST116"));
        }
        Ok(())
    }
}

struct StaticProbe {
    online: watch::Sender<bool>,
}

impl StaticProbe {
    fn new(online: bool) -> Self {
        Self {
            online: watch::Sender::new(online),
        }
    }

    fn set(&self, online: bool) {
        self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }
}

impl ConnectivityProbe for StaticProbe {
    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

fn build_synchronizer(
    store: Arc<MemoryStore>,
    remote: Arc<FakeRemote>,
    probe: Arc<StaticProbe>,
) -> QueueSynchronizer<MemoryStore> {
    QueueSynchronizer::new(store, remote, probe)
}

#[tokio::test]
async fn drain_applies_operations_in_fifo_order() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let sync = build_synchronizer(store.clone(), remote.clone(), probe);

    for seq in 1..=3 {
        store
            .stage_create(EntityKind::Program, json!({ "name": format!("program-{seq}") }))
            .await
            .expect("stage create");
    }

    let outcome = sync.drain(EntityKind::Program).await;
    assert_eq!(outcome.status, DrainStatus::Completed);
    assert_eq!(outcome.synced_count, 3);
    assert!(outcome.first_error.is_none());

    let inserts: Vec<String> = remote
        .calls()
        .into_iter()
        .filter(|c| c.method == "insert")
        .map(|c| c.payload["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(inserts, vec!["program-1", "program-2", "program-3"]);
    assert!(store.operations().is_empty());
    assert!(store.records().iter().all(|r| r.remote_id.is_some()));
    assert!(store.records().iter().all(|r| !r.has_pending_writes));
}

#[tokio::test]
async fn stop_on_error_leaves_later_operations_untouched() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let sync = build_synchronizer(store.clone(), remote.clone(), probe);

    // Operation 1 targets a remote-backed row (update), operations 2 and 3
    // follow; the update is scripted to fail.
    let key1 = store.push_record(
        EntityKind::Program,
        Some("srv-1"),
        json!({ "id": "srv-1", "name": "before" }),
    );
    remote.seed_row("programs", json!({ "id": "srv-1", "name": "before" }));
    store
        .stage_update(
            EntityKind::Program,
            RecordIdentity::local(key1),
            json!({ "name": "after" }),
        )
        .await
        .expect("stage update");
    store
        .stage_create(EntityKind::Program, json!({ "name": "second" }))
        .await
        .expect("stage create");
    store
        .stage_create(EntityKind::Program, json!({ "name": "third" }))
        .await
        .expect("stage create");

    remote.script_error("update", RemoteError::api(500, "server exploded"));

    let outcome = sync.drain(EntityKind::Program).await;
    assert_eq!(outcome.status, DrainStatus::Stopped);
    assert_eq!(outcome.synced_count, 0);
    assert!(outcome.first_error.as_deref().unwrap().contains("server exploded"));

    // Nothing after the failure was attempted; all three operations remain.
    assert_eq!(store.operations().len(), 3);
    let inserts = remote
        .calls()
        .into_iter()
        .filter(|c| c.method == "insert")
        .count();
    assert_eq!(inserts, 0);

    let record = store
        .get_record(EntityKind::Program, &RecordIdentity::local(key1))
        .await
        .unwrap()
        .unwrap();
    assert!(record.sync_error.as_deref().unwrap().contains("server exploded"));
}

#[tokio::test]
async fn create_conflict_adopts_existing_remote_row() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let sync = build_synchronizer(store.clone(), remote.clone(), probe);

    remote.seed_row(
        "resources",
        json!({ "id": "srv-9", "name": "Bandages", "category": "medical", "current_stock": 7 }),
    );
    store
        .stage_create(
            EntityKind::Resource,
            json!({ "name": "Bandages", "category": "medical", "current_stock": 5 }),
        )
        .await
        .expect("stage create");
    remote.script_error(
        "insert",
        RemoteError::api(409, "duplicate key value violates unique constraint").with_code("23505"),
    );

    let outcome = sync.drain(EntityKind::Resource).await;
    assert_eq!(outcome.status, DrainStatus::Completed);
    assert_eq!(outcome.synced_count, 1);

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].remote_id.as_deref(), Some("srv-9"));
    assert_eq!(records[0].fields["current_stock"], json!(7));
    assert!(!records[0].has_pending_writes);
    assert!(store.operations().is_empty());
}

#[tokio::test]
async fn update_without_remote_id_is_a_fatal_invariant_violation() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let sync = build_synchronizer(store.clone(), remote.clone(), probe);

    let key = store.push_record(EntityKind::Program, None, json!({ "name": "orphan" }));
    store.push_operation(
        EntityKind::Program,
        OperationType::Update,
        key,
        None,
        json!({ "name": "renamed" }),
        None,
    );
    store.mark_pending(key, PendingAction::Update);

    let outcome = sync.drain(EntityKind::Program).await;
    assert_eq!(outcome.status, DrainStatus::Stopped);
    assert!(outcome.first_error.as_deref().unwrap().contains("no remote id"));
    assert_eq!(store.operations().len(), 1);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn delete_of_already_missing_remote_row_reconciles_locally() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let sync = build_synchronizer(store.clone(), remote.clone(), probe);

    let key = store.push_record(
        EntityKind::Client,
        Some("srv-4"),
        json!({ "id": "srv-4", "first_name": "Ada" }),
    );
    store
        .stage_delete(EntityKind::Client, RecordIdentity::local(key))
        .await
        .expect("stage delete");

    // Remote table is empty: the delete call 404s, which still counts as done.
    let outcome = sync.drain(EntityKind::Client).await;
    assert_eq!(outcome.status, DrainStatus::Completed);
    assert_eq!(outcome.synced_count, 1);
    assert!(store.records().is_empty());
    assert!(store.operations().is_empty());
}

#[tokio::test]
async fn local_only_delete_never_reaches_the_network() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let sync = build_synchronizer(store.clone(), remote.clone(), probe);

    let key = store
        .stage_create(EntityKind::Enrollment, json!({ "client_id": "c1", "program_id": "p1" }))
        .await
        .expect("stage create");
    store
        .stage_delete(EntityKind::Enrollment, RecordIdentity::local(key))
        .await
        .expect("stage delete");

    assert!(store.records().is_empty());
    assert!(store.operations().is_empty());

    let outcome = sync.drain(EntityKind::Enrollment).await;
    assert_eq!(outcome.status, DrainStatus::Completed);
    assert_eq!(outcome.synced_count, 0);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn stock_adjustment_swallows_missing_ledger_reference() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let sync = build_synchronizer(store.clone(), remote.clone(), probe);

    let key = store.push_record(
        EntityKind::Resource,
        Some("srv-2"),
        json!({ "id": "srv-2", "name": "Blankets", "category": "shelter", "current_stock": 4 }),
    );
    remote.seed_row(
        "resources",
        json!({ "id": "srv-2", "name": "Blankets", "category": "shelter", "current_stock": 4 }),
    );
    store
        .stage_stock_adjustment(
            EntityKind::Resource,
            RecordIdentity::local(key),
            -3,
            Some("distributed".to_string()),
        )
        .await
        .expect("stage adjustment");

    remote.script_error(
        "insert",
        RemoteError::api(409, "violates foreign key constraint").with_code("23503"),
    );

    let outcome = sync.drain(EntityKind::Resource).await;
    assert_eq!(outcome.status, DrainStatus::Completed);
    assert_eq!(outcome.synced_count, 1);
    assert_eq!(remote.rows("resources")[0]["current_stock"], json!(1));
    assert!(store.operations().is_empty());

    // The ledger insert carried the remote reference before failing.
    let ledger_call = remote
        .calls()
        .into_iter()
        .find(|c| c.table == "stock_transactions")
        .expect("ledger insert attempted");
    assert_eq!(ledger_call.payload["resource_id"], json!("srv-2"));
}

#[tokio::test]
async fn stock_adjustment_other_secondary_failures_are_fatal() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let sync = build_synchronizer(store.clone(), remote.clone(), probe);

    let key = store.push_record(
        EntityKind::Resource,
        Some("srv-2"),
        json!({ "id": "srv-2", "name": "Blankets", "category": "shelter", "current_stock": 4 }),
    );
    remote.seed_row(
        "resources",
        json!({ "id": "srv-2", "name": "Blankets", "category": "shelter", "current_stock": 4 }),
    );
    store
        .stage_stock_adjustment(EntityKind::Resource, RecordIdentity::local(key), -1, None)
        .await
        .expect("stage adjustment");

    remote.script_error("insert", RemoteError::api(500, "ledger table unavailable"));

    let outcome = sync.drain(EntityKind::Resource).await;
    assert_eq!(outcome.status, DrainStatus::Stopped);
    assert!(outcome
        .first_error
        .as_deref()
        .unwrap()
        .contains("ledger table unavailable"));
    assert_eq!(store.operations().len(), 1);
}

#[tokio::test]
async fn offline_drain_is_skipped_without_touching_the_queue() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(false));
    let sync = build_synchronizer(store.clone(), remote.clone(), probe);

    store
        .stage_create(EntityKind::Program, json!({ "name": "pantry" }))
        .await
        .expect("stage create");

    let outcome = sync.drain(EntityKind::Program).await;
    assert_eq!(outcome.status, DrainStatus::Offline);
    assert_eq!(outcome.synced_count, 0);
    assert_eq!(store.operations().len(), 1);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn concurrent_drains_share_one_execution() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote {
        insert_delay: Some(Duration::from_millis(50)),
        ..FakeRemote::default()
    });
    let probe = Arc::new(StaticProbe::new(true));
    let sync = Arc::new(build_synchronizer(store.clone(), remote.clone(), probe));

    store
        .stage_create(EntityKind::Program, json!({ "name": "pantry" }))
        .await
        .expect("stage create");

    let first = sync.drain(EntityKind::Program);
    let second = sync.drain(EntityKind::Program);
    let (a, b) = tokio::join!(first, second);

    assert_eq!(a, b);
    assert_eq!(a.synced_count, 1);
    let inserts = remote
        .calls()
        .into_iter()
        .filter(|c| c.method == "insert")
        .count();
    assert_eq!(inserts, 1);
}

#[tokio::test]
async fn reconnect_transition_triggers_a_drain() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(false));
    let sync = Arc::new(QueueSynchronizer::new(
        store.clone(),
        remote.clone(),
        probe.clone(),
    ));

    store
        .stage_create(EntityKind::Program, json!({ "name": "pantry" }))
        .await
        .expect("stage create");

    let task = sync.spawn_reconnect_drain();
    probe.set(true);

    // Wait for the background drain to clear the queue.
    for _ in 0..50 {
        if store.operations().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.operations().is_empty());
    task.abort();
}

#[tokio::test]
async fn hydration_is_skipped_while_offline() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(false));
    let loader = SnapshotLoader::new(store.clone(), remote.clone(), probe);

    remote.seed_row("programs", json!({ "id": "srv-1", "name": "pantry" }));
    let outcome = loader.hydrate_all(EntityKind::Program).await.expect("hydrate");
    assert_eq!(outcome, HydrationOutcome::Offline);
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn hydration_never_clobbers_pending_rows() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let loader = SnapshotLoader::new(store.clone(), remote.clone(), probe);

    let key = store.push_record(
        EntityKind::Program,
        Some("srv-1"),
        json!({ "id": "srv-1", "name": "locally edited" }),
    );
    store.mark_pending(key, PendingAction::Update);
    remote.seed_row("programs", json!({ "id": "srv-1", "name": "remote version" }));

    loader.hydrate_all(EntityKind::Program).await.expect("hydrate");

    let record = store
        .get_record(EntityKind::Program, &RecordIdentity::local(key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.fields["name"], json!("locally edited"));
}

#[tokio::test]
async fn scoped_hydration_rejects_unscoped_entities() {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(FakeRemote::default());
    let probe = Arc::new(StaticProbe::new(true));
    let loader = SnapshotLoader::new(store, remote, probe);

    let err = loader
        .hydrate_scoped(EntityKind::Program, "some-scope")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
