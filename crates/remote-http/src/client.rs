//! HTTP client for the remote relational API.
//!
//! The backend exposes PostgREST-style per-table endpoints: equality filters
//! and ordering as query parameters, `Prefer: return=representation` to get
//! affected rows back, and Postgres SQLSTATE codes in error bodies. Those
//! codes are preserved on [`RemoteError`] so the synchronizer can recognize
//! unique-conflict and missing-reference failures.

use std::time::Duration;

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;

use async_trait::async_trait;
use casework_core::errors::RemoteError;
use casework_core::sync::{RemoteFilter, RemoteOrder, RemoteStore};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct RemoteHttpConfig {
    pub base_url: String,
    pub api_key: String,
}

impl RemoteHttpConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Read `CASEWORK_API_URL` / `CASEWORK_API_KEY`; `None` when the service
    /// is not configured, which callers treat as running local-only.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("CASEWORK_API_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())?;
        let api_key = std::env::var("CASEWORK_API_KEY").unwrap_or_default();
        Some(Self::new(base_url, api_key))
    }
}

#[derive(Debug, Deserialize, Default)]
struct ApiErrorBody {
    code: Option<String>,
    message: Option<String>,
}

fn filter_literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::transport(err.to_string())
}

async fn api_error(response: reqwest::Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let message = parsed.message.unwrap_or_else(|| {
        body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>()
    });
    let mut err = RemoteError::api(status, message);
    if let Some(code) = parsed.code {
        err = err.with_code(code);
    }
    err
}

#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    config: RemoteHttpConfig,
}

impl HttpRemoteStore {
    pub fn new(config: RemoteHttpConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(transport_error)?;
        Ok(Self { client, config })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !self.config.api_key.is_empty() {
            if let Ok(bearer) =
                HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            {
                headers.insert(AUTHORIZATION, bearer);
            }
            if let Ok(key) = HeaderValue::from_str(&self.config.api_key) {
                headers.insert("apikey", key);
            }
        }
        headers
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.config.base_url, table)
    }

    fn select_url(
        &self,
        table: &str,
        filters: &[RemoteFilter],
        order: Option<&RemoteOrder>,
    ) -> String {
        let mut params = vec!["select=*".to_string()];
        for filter in filters {
            params.push(format!(
                "{}=eq.{}",
                filter.field,
                urlencoding::encode(&filter_literal(&filter.value))
            ));
        }
        if let Some(order) = order {
            let direction = if order.ascending { "asc" } else { "desc" };
            params.push(format!("order={}.{}", order.field, direction));
        }
        format!("{}?{}", self.table_url(table), params.join("&"))
    }

    fn row_url(&self, table: &str, id: &str) -> String {
        format!("{}?id=eq.{}", self.table_url(table), urlencoding::encode(id))
    }

    /// Representation responses come back as arrays; an empty one means no
    /// row matched.
    fn single_row(table: &str, id: &str, body: Value) -> Result<Value, RemoteError> {
        match body {
            Value::Array(mut rows) if !rows.is_empty() => Ok(rows.remove(0)),
            Value::Object(_) => Ok(body),
            _ => Err(RemoteError::api(404, format!("No row {id} in {table}"))
                .with_code("PGRST116")),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn select(
        &self,
        table: &str,
        filters: &[RemoteFilter],
        order: Option<&RemoteOrder>,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = self.select_url(table, filters, order);
        debug!("[CaseSync] GET {}", url);
        let response = self
            .client
            .get(&url)
            .headers(self.headers())
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| RemoteError::transport(format!("Invalid response body: {e}")))
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, RemoteError> {
        let url = self.table_url(table);
        debug!("[CaseSync] POST {}", url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::transport(format!("Invalid response body: {e}")))?;
        Self::single_row(table, "<new>", body)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, RemoteError> {
        let url = self.row_url(table, id);
        debug!("[CaseSync] PATCH {}", url);
        let response = self
            .client
            .patch(&url)
            .headers(self.headers())
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::transport(format!("Invalid response body: {e}")))?;
        Self::single_row(table, id, body)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let url = self.row_url(table, id);
        debug!("[CaseSync] DELETE {}", url);
        let response = self
            .client
            .delete(&url)
            .headers(self.headers())
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::transport(format!("Invalid response body: {e}")))?;
        // Deleting a row the server no longer has surfaces as not-found so
        // the synchronizer can reconcile locally.
        Self::single_row(table, id, body).map(|_| ())
    }
}
