//! Collaborator contracts: the remote CRUD service and the connectivity
//! signal. Neither is implemented here; see the `casework-remote-http` crate.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::errors::RemoteError;

/// Equality filter applied to a remote read.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFilter {
    pub field: String,
    pub value: serde_json::Value,
}

impl RemoteFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Sort order for a remote read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOrder {
    pub field: String,
    pub ascending: bool,
}

impl RemoteOrder {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }
}

/// Per-table CRUD + filtered query API exposed by the remote relational
/// service. Rows are JSON objects keyed by column name; the server assigns
/// `id` on insert.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(
        &self,
        table: &str,
        filters: &[RemoteFilter],
        order: Option<&RemoteOrder>,
    ) -> std::result::Result<Vec<serde_json::Value>, RemoteError>;

    async fn insert(
        &self,
        table: &str,
        row: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, RemoteError>;

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, RemoteError>;

    async fn delete(&self, table: &str, id: &str) -> std::result::Result<(), RemoteError>;
}

/// Injected online/offline indicator.
///
/// `is_online` is a fast-path guard polled before remote work; `watch`
/// exposes the transition stream the synchronizer subscribes to so a
/// reconnect triggers a drain directly.
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
    fn watch(&self) -> watch::Receiver<bool>;
}
