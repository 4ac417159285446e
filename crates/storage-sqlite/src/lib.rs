//! SQLite-backed local record store and operation queue.

pub mod cache;
pub mod db;
pub mod errors;
pub mod schema;

pub use cache::{CacheRepository, ChangeNotifier, RecordSubscription};
pub use db::{create_pool, get_connection, init, run_migrations, spawn_writer, DbPool, WriteHandle};
pub use errors::StorageError;
