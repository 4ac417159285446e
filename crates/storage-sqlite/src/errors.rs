//! Storage-layer error type, mapped into the core error taxonomy at the
//! crate boundary.

use casework_core::errors::{DatabaseError, Error};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Query failed: {0}")]
    Diesel(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Connection failed: {0}")]
    Connection(#[from] diesel::result::ConnectionError),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Write actor unavailable: {0}")]
    WriterGone(String),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Diesel(e) => Error::Database(DatabaseError::Query(e.to_string())),
            StorageError::Pool(e) => Error::Database(DatabaseError::Pool(e.to_string())),
            StorageError::Connection(e) => Error::Database(DatabaseError::Internal(e.to_string())),
            StorageError::Migration(message) => Error::Database(DatabaseError::Internal(message)),
            StorageError::WriterGone(message) => Error::Database(DatabaseError::Internal(message)),
        }
    }
}
