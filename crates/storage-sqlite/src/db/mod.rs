//! Database bootstrap: path resolution, migrations, connection pool, and the
//! single-writer actor.

use std::path::Path;
use std::sync::Arc;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;

use casework_core::errors::{DatabaseError, Error, Result};

use crate::errors::StorageError;

pub mod write_actor;

pub use write_actor::{spawn_writer, WriteHandle};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const DB_FILENAME: &str = "casework.db";

/// Ensure the app data directory exists and return the database file path.
pub fn init(app_data_dir: &str) -> Result<String> {
    let dir = Path::new(app_data_dir);
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::Database(DatabaseError::Internal(format!(
                "Failed to create app data directory: {}",
                e
            )))
        })?;
    }
    let db_path = dir.join(DB_FILENAME);
    Ok(db_path.to_string_lossy().to_string())
}

/// Run any pending migrations against the database file.
pub fn run_migrations(db_path: &str) -> Result<()> {
    let mut conn = SqliteConnection::establish(db_path).map_err(StorageError::from)?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    if !applied.is_empty() {
        info!("[CaseSync] Applied {} database migrations", applied.len());
    }
    Ok(())
}

#[derive(Debug)]
struct SqliteCustomizer;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqliteCustomizer {
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA busy_timeout = 5000; \
             PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Build the shared read pool. All writes go through the write actor; readers
/// take connections from here directly.
pub fn create_pool(db_path: &str) -> Result<Arc<DbPool>> {
    let manager = ConnectionManager::<SqliteConnection>::new(db_path);
    let pool = Pool::builder()
        .max_size(8)
        .connection_customizer(Box::new(SqliteCustomizer))
        .build(manager)
        .map_err(|e| Error::Database(DatabaseError::Pool(e.to_string())))?;
    Ok(Arc::new(pool))
}

pub fn get_connection(pool: &Arc<DbPool>) -> Result<DbConnection> {
    pool.get()
        .map_err(|e| Error::Database(DatabaseError::Pool(e.to_string())))
}
