//! Snapshot loader: pulls the authoritative remote collection and merges it
//! into the local store without clobbering pending rows.

use std::sync::Arc;

use log::debug;

use crate::errors::{Error, Result};

use super::{
    descriptor, CacheStore, ConnectivityProbe, EntityKind, HydrationOutcome, RemoteFilter,
    RemoteOrder, RemoteStore,
};

pub struct SnapshotLoader<S> {
    store: Arc<S>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivityProbe>,
}

impl<S: CacheStore> SnapshotLoader<S> {
    pub fn new(
        store: Arc<S>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
        }
    }

    /// Refresh the full local collection for an entity. Non-pending rows
    /// missing from the snapshot are pruned.
    pub async fn hydrate_all(&self, entity: EntityKind) -> Result<HydrationOutcome> {
        self.hydrate(entity, None).await
    }

    /// Refresh only the rows under one scope key (e.g. a parent program id).
    /// Rows outside the scope are never touched.
    pub async fn hydrate_scoped(
        &self,
        entity: EntityKind,
        scope: &str,
    ) -> Result<HydrationOutcome> {
        self.hydrate(entity, Some(scope)).await
    }

    async fn hydrate(&self, entity: EntityKind, scope: Option<&str>) -> Result<HydrationOutcome> {
        if !self.connectivity.is_online() {
            debug!(
                "[CaseSync] Hydration skipped for {}: offline, serving local cache",
                entity.as_str()
            );
            return Ok(HydrationOutcome::Offline);
        }

        let d = descriptor(entity);
        let filters = match scope {
            Some(value) => {
                let field = d.scope_field.ok_or_else(|| {
                    Error::validation(format!("{} has no scope field", entity.as_str()))
                })?;
                vec![RemoteFilter::eq(field, value)]
            }
            None => Vec::new(),
        };

        let rows = self
            .remote
            .select(d.table, &filters, Some(&RemoteOrder::asc(d.order_field)))
            .await
            .map_err(Error::Remote)?;

        let applied = self
            .store
            .apply_remote_snapshot(entity, rows, scope.map(String::from))
            .await?;

        debug!(
            "[CaseSync] Hydrated {} rows for {}{}",
            applied,
            entity.as_str(),
            scope.map(|s| format!(" scope={s}")).unwrap_or_default()
        );
        Ok(HydrationOutcome::Applied(applied))
    }
}
