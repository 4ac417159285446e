//! Change notification and live record subscriptions.
//!
//! The repository broadcasts the entity kind after every committed mutation.
//! A subscription replays the current snapshot first, then reloads whenever
//! its entity changes, so UI list views read the cache and never the network.

use std::sync::Arc;

use log::debug;
use tokio::sync::broadcast;

use casework_core::errors::Result;
use casework_core::sync::{CacheStore, EntityKind, LocalRecord};

use super::repository::CacheRepository;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<EntityKind>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget: a send with no subscribers is not an error.
    pub fn notify(&self, entity: EntityKind) {
        let _ = self.tx.send(entity);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityKind> {
        self.tx.subscribe()
    }
}

pub struct RecordSubscription {
    store: Arc<CacheRepository>,
    entity: EntityKind,
    scope: Option<String>,
    events: broadcast::Receiver<EntityKind>,
    primed: bool,
}

impl RecordSubscription {
    pub(crate) fn new(
        store: Arc<CacheRepository>,
        entity: EntityKind,
        scope: Option<String>,
    ) -> Self {
        let events = store.notifier().subscribe();
        Self {
            store,
            entity,
            scope,
            events,
            primed: false,
        }
    }

    async fn load(&self) -> Result<Vec<LocalRecord>> {
        self.store
            .list_records(self.entity, self.scope.as_deref())
            .await
    }

    /// Next view of the subscribed records. The first call returns the
    /// current snapshot; later calls wait for a change to this entity.
    /// Returns `None` once the notifier is gone.
    pub async fn next(&mut self) -> Result<Option<Vec<LocalRecord>>> {
        if !self.primed {
            self.primed = true;
            return Ok(Some(self.load().await?));
        }
        loop {
            match self.events.recv().await {
                Ok(entity) if entity == self.entity => {
                    return Ok(Some(self.load().await?));
                }
                Ok(_) => continue,
                // Missed notifications collapse into one reload; the cache
                // read always reflects the latest committed state.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        "[CaseSync] Subscription for {} lagged by {} events, reloading",
                        self.entity.as_str(),
                        skipped
                    );
                    return Ok(Some(self.load().await?));
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::cache::CacheRepository;
    use crate::db::{create_pool, init, run_migrations, write_actor::spawn_writer};

    fn setup_repo() -> Arc<CacheRepository> {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        let writer = spawn_writer(pool.as_ref().clone());
        Arc::new(CacheRepository::new(pool, writer))
    }

    #[tokio::test]
    async fn emits_snapshot_first_then_reloads_on_change() {
        let repo = setup_repo();
        repo.stage_create(EntityKind::Program, json!({ "name": "Pantry" }))
            .await
            .expect("seed");

        let mut sub = repo.subscribe(EntityKind::Program, None);
        let initial = sub.next().await.expect("next").expect("snapshot");
        assert_eq!(initial.len(), 1);

        repo.stage_create(EntityKind::Program, json!({ "name": "Clinic" }))
            .await
            .expect("create");
        let updated = sub.next().await.expect("next").expect("reload");
        assert_eq!(updated.len(), 2);
    }

    #[tokio::test]
    async fn ignores_changes_to_other_entities() {
        let repo = setup_repo();
        let mut sub = repo.subscribe(EntityKind::Program, None);
        let _ = sub.next().await.expect("prime");

        // An unrelated entity change must not wake the subscription; a
        // matching one after it must.
        repo.stage_create(EntityKind::Client, json!({ "first_name": "Ada" }))
            .await
            .expect("client");
        repo.stage_create(EntityKind::Program, json!({ "name": "Pantry" }))
            .await
            .expect("program");

        let view = sub.next().await.expect("next").expect("reload");
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].fields["name"], json!("Pantry"));
    }

    #[tokio::test]
    async fn scoped_subscription_filters_by_scope_key() {
        let repo = setup_repo();
        repo.apply_remote_snapshot(
            EntityKind::Enrollment,
            vec![
                json!({ "id": "e-1", "program_id": "p-1" }),
                json!({ "id": "e-2", "program_id": "p-2" }),
            ],
            None,
        )
        .await
        .expect("snapshot");

        let mut sub = repo.subscribe(EntityKind::Enrollment, Some("p-1".to_string()));
        let view = sub.next().await.expect("next").expect("snapshot");
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].remote_id.as_deref(), Some("e-1"));
    }
}
