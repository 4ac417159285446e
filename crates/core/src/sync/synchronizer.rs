//! Queue synchronizer: replays staged operations against the remote service
//! in FIFO order, one entity type at a time, stopping at the first failure.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::{Error, Result};

use super::{
    descriptor, CacheStore, ConnectivityProbe, DrainOutcome, DrainStatus, EntityKind,
    OperationType, QueueOperation, RemoteFilter, RemoteStore, CASE_SYNC_ENTITIES,
};

/// Per-operation progress hook, called with the operation about to replay and
/// the running synced count. Used for UI status text.
pub type ProgressCallback = Arc<dyn Fn(&QueueOperation, usize) + Send + Sync>;

type SharedDrain = Shared<BoxFuture<'static, DrainOutcome>>;

pub struct QueueSynchronizer<S> {
    store: Arc<S>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivityProbe>,
    in_flight: Arc<Mutex<HashMap<EntityKind, SharedDrain>>>,
}

impl<S: CacheStore + 'static> QueueSynchronizer<S> {
    pub fn new(
        store: Arc<S>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replay all queued operations for one entity type.
    ///
    /// At most one drain per entity type runs at a time; concurrent callers
    /// join the in-flight drain and receive its outcome.
    pub async fn drain(&self, entity: EntityKind) -> DrainOutcome {
        self.drain_with_progress(entity, None).await
    }

    /// Like [`drain`](Self::drain), with a progress hook. The hook only fires
    /// for a drain this call starts; callers joining an in-flight drain get
    /// its outcome without progress events.
    pub async fn drain_with_progress(
        &self,
        entity: EntityKind,
        progress: Option<ProgressCallback>,
    ) -> DrainOutcome {
        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&entity) {
                Some(existing) => existing.clone(),
                None => {
                    let store = Arc::clone(&self.store);
                    let remote = Arc::clone(&self.remote);
                    let connectivity = Arc::clone(&self.connectivity);
                    let registry = Arc::clone(&self.in_flight);
                    let fut = async move {
                        let outcome =
                            run_drain(store, remote, connectivity, entity, progress).await;
                        registry.lock().await.remove(&entity);
                        outcome
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(entity, fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    /// Drain every synced entity type sequentially. Queues are independent
    /// across entity types, so a stop in one does not block the others.
    pub async fn drain_all(&self) -> Vec<(EntityKind, DrainOutcome)> {
        let mut outcomes = Vec::with_capacity(CASE_SYNC_ENTITIES.len());
        for entity in CASE_SYNC_ENTITIES {
            outcomes.push((entity, self.drain(entity).await));
        }
        outcomes
    }

    /// Subscribe to the connectivity signal and drain all queues on each
    /// offline-to-online transition. Returns the background task handle.
    pub fn spawn_reconnect_drain(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sync = Arc::clone(self);
        let mut watch = sync.connectivity.watch();
        tokio::spawn(async move {
            let mut was_online = *watch.borrow();
            while watch.changed().await.is_ok() {
                let online = *watch.borrow();
                if online && !was_online {
                    info!("[CaseSync] Connectivity restored, draining queues");
                    for (entity, outcome) in sync.drain_all().await {
                        if let Some(error) = &outcome.first_error {
                            warn!(
                                "[CaseSync] Reconnect drain stopped for {}: {}",
                                entity.as_str(),
                                error
                            );
                        }
                    }
                }
                was_online = online;
            }
        })
    }
}

async fn run_drain<S: CacheStore>(
    store: Arc<S>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivityProbe>,
    entity: EntityKind,
    progress: Option<ProgressCallback>,
) -> DrainOutcome {
    if !connectivity.is_online() {
        debug!(
            "[CaseSync] Drain skipped for {}: offline",
            entity.as_str()
        );
        return DrainOutcome::offline();
    }

    let operations = match store.pending_operations(entity).await {
        Ok(operations) => operations,
        Err(err) => {
            return DrainOutcome {
                status: DrainStatus::Stopped,
                synced_count: 0,
                first_error: Some(err.to_string()),
            }
        }
    };

    let mut synced_count = 0usize;
    for operation in &operations {
        if let Some(callback) = &progress {
            callback(operation, synced_count);
        }
        match apply_operation(store.as_ref(), remote.as_ref(), operation).await {
            Ok(()) => synced_count += 1,
            Err(err) => {
                // Stop here: replaying operation N+1 after N failed could
                // apply changes out of causal order.
                let message = err.to_string();
                match &err {
                    Error::Remote(remote) => warn!(
                        "[CaseSync] Drain stopped for {} at queue_id={} ({:?}): {}",
                        entity.as_str(),
                        operation.queue_id,
                        remote.retry_class(),
                        message
                    ),
                    _ => warn!(
                        "[CaseSync] Drain stopped for {} at queue_id={}: {}",
                        entity.as_str(),
                        operation.queue_id,
                        message
                    ),
                }
                if let Err(store_err) = store.record_sync_error(operation, &message).await {
                    warn!(
                        "[CaseSync] Failed to record sync error for queue_id={}: {}",
                        operation.queue_id, store_err
                    );
                }
                return DrainOutcome {
                    status: DrainStatus::Stopped,
                    synced_count,
                    first_error: Some(message),
                };
            }
        }
    }

    if let Err(err) = store.dedup_sweep(entity).await {
        warn!(
            "[CaseSync] Dedup sweep failed for {}: {}",
            entity.as_str(),
            err
        );
    }

    debug!(
        "[CaseSync] Drained {} operations for {}",
        synced_count,
        entity.as_str()
    );
    DrainOutcome {
        status: DrainStatus::Completed,
        synced_count,
        first_error: None,
    }
}

async fn apply_operation<S: CacheStore>(
    store: &S,
    remote: &dyn RemoteStore,
    operation: &QueueOperation,
) -> Result<()> {
    let d = descriptor(operation.entity);
    match operation.operation_type {
        OperationType::Create => match remote.insert(d.table, operation.payload.clone()).await {
            Ok(row) => store.mark_operation_synced(operation, Some(row)).await,
            Err(err) if err.is_unique_conflict() => {
                resolve_create_conflict(store, remote, operation).await
            }
            Err(err) => Err(Error::Remote(err)),
        },
        OperationType::Update => {
            let remote_id = require_remote_id(operation)?;
            let row = remote
                .update(d.table, &remote_id, operation.payload.clone())
                .await
                .map_err(Error::Remote)?;
            store.mark_operation_synced(operation, Some(row)).await
        }
        OperationType::Delete => {
            if let Some(remote_id) = &operation.target_remote_id {
                match remote.delete(d.table, remote_id).await {
                    Ok(()) => {}
                    // Row already gone remotely: the delete's goal is met.
                    Err(err) if err.is_not_found() => {
                        debug!(
                            "[CaseSync] Remote row {} already deleted, reconciling locally",
                            remote_id
                        );
                    }
                    Err(err) => return Err(Error::Remote(err)),
                }
            }
            store.complete_delete(operation).await
        }
        OperationType::AdjustStock => {
            let remote_id = require_remote_id(operation)?;
            let row = remote
                .update(d.table, &remote_id, operation.payload.clone())
                .await
                .map_err(Error::Remote)?;

            if let (Some(ledger), Some(secondary)) = (&d.ledger, &operation.secondary_payload) {
                let mut ledger_row = secondary.clone();
                if let Some(object) = ledger_row.as_object_mut() {
                    object.insert(
                        ledger.reference_field.to_string(),
                        Value::String(remote_id.clone()),
                    );
                }
                match remote.insert(ledger.table, ledger_row).await {
                    Ok(_) => {}
                    // The stock update itself landed; a ledger row pointing
                    // at a not-yet-visible resource is not worth wedging the
                    // queue over.
                    Err(err) if err.is_missing_reference() => {
                        warn!(
                            "[CaseSync] Ledger insert skipped for resource {}: {}",
                            remote_id, err
                        );
                    }
                    Err(err) => return Err(Error::Remote(err)),
                }
            }
            store.mark_operation_synced(operation, Some(row)).await
        }
    }
}

/// A create collided with an existing remote row: look it up by the entity's
/// natural identity and adopt it instead of retrying the insert. Avoids
/// duplicate rows when a prior sync partially succeeded but the client never
/// saw the confirmation.
async fn resolve_create_conflict<S: CacheStore>(
    store: &S,
    remote: &dyn RemoteStore,
    operation: &QueueOperation,
) -> Result<()> {
    let d = descriptor(operation.entity);
    let mut filters = Vec::with_capacity(d.conflict_fields.len());
    for field in d.conflict_fields {
        match operation.payload.get(*field) {
            Some(value) if !value.is_null() => {
                filters.push(RemoteFilter::eq(*field, value.clone()))
            }
            _ => {
                return Err(Error::validation(format!(
                    "create conflict for {} cannot be resolved: payload missing natural key '{}'",
                    operation.entity.as_str(),
                    field
                )))
            }
        }
    }

    let matches = remote
        .select(d.table, &filters, None)
        .await
        .map_err(Error::Remote)?;
    match matches.into_iter().next() {
        Some(row) => {
            info!(
                "[CaseSync] Create conflict for {} queue_id={}: adopted existing remote row",
                operation.entity.as_str(),
                operation.queue_id
            );
            store.mark_operation_synced(operation, Some(row)).await
        }
        None => Err(Error::validation(format!(
            "create conflict for {} but no remote row matches its natural identity",
            operation.entity.as_str()
        ))),
    }
}

fn require_remote_id(operation: &QueueOperation) -> Result<String> {
    operation.target_remote_id.clone().ok_or_else(|| {
        // Staging guarantees updates only queue against remote-backed rows;
        // reaching this is a programming error, surfaced as a fatal sync
        // error rather than silently skipped.
        Error::validation(format!(
            "{} operation queue_id={} has no remote id",
            operation.operation_type.as_str(),
            operation.queue_id
        ))
    })
}
