//! Error types shared across the casework crates.

use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Database-layer failures, produced by the storage crate.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection pool error
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Query execution failure
    #[error("Query failed: {0}")]
    Query(String),

    /// Anything else that went wrong inside the storage layer
    #[error("Internal database error: {0}")]
    Internal(String),
}

/// Top-level error taxonomy for cache mutators, hydration, and sync.
#[derive(Debug, Error)]
pub enum Error {
    /// A staged mutation would violate a domain invariant; nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The identity passed to a cache mutator resolves to no local record.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Local table store failure.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Remote service call failure.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

/// Retry policy class for remote failures. Informational only: the queue
/// synchronizer stops at the first error regardless of class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Error returned by [`crate::sync::RemoteStore`] implementations.
///
/// Carries the HTTP status and the backend error code (Postgres SQLSTATE for
/// PostgREST-style services) so the synchronizer can recognize the conflict
/// and missing-reference classes it handles specially.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

const UNIQUE_VIOLATION_CODE: &str = "23505";
const FOREIGN_KEY_VIOLATION_CODE: &str = "23503";

impl RemoteError {
    /// Error from an API response with a known HTTP status.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
        }
    }

    /// Transport-level failure (connect, timeout) with no HTTP status.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// True when a remote insert collided with an existing row.
    pub fn is_unique_conflict(&self) -> bool {
        if self.code.as_deref() == Some(UNIQUE_VIOLATION_CODE) {
            return true;
        }
        if self.status == Some(409) {
            return true;
        }
        self.message
            .contains("duplicate key value violates unique constraint")
    }

    /// True when an insert referenced a row the server cannot see yet.
    pub fn is_missing_reference(&self) -> bool {
        self.code.as_deref() == Some(FOREIGN_KEY_VIOLATION_CODE)
            || self.message.contains("violates foreign key constraint")
    }

    /// True when the target row does not exist remotely.
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404) || self.code.as_deref() == Some("PGRST116")
    }

    /// Classify for retry policy.
    pub fn retry_class(&self) -> RemoteRetryClass {
        match self.status {
            Some(401) | Some(403) => RemoteRetryClass::ReauthRequired,
            Some(408) | Some(409) | Some(423) | Some(425) | Some(429) => {
                RemoteRetryClass::Retryable
            }
            Some(status) if (500..=599).contains(&status) => RemoteRetryClass::Retryable,
            Some(_) => RemoteRetryClass::Permanent,
            None => RemoteRetryClass::Retryable,
        }
    }
}
