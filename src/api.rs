//! HTTP client for the remote datastore.
//!
//! Talks to a PostgREST-style REST surface (`/rest/v1/{table}`) and to
//! serverless functions (`/functions/v1/{name}`). Implements `RemoteStore`
//! so the cache managers never see HTTP details.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::RemoteError;
use crate::remote::{Filter, Query, RemoteStore, Table};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote base URL:
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_remote_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_remote_url)
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly transport error.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    let message = if err.is_connect() {
        format!("Cannot reach remote datastore at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid remote datastore URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    RemoteError::Transport(message)
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key or session is invalid or expired".to_string(),
        403 => "Not authorized for this resource".to_string(),
        404 => "Remote endpoint not found".to_string(),
        409 => "Conflicting row already exists".to_string(),
        s if s >= 500 => "Remote server error".to_string(),
        _ => "Unexpected response from remote".to_string(),
    }
}

/// Build the error for a non-2xx response, keeping server detail for logs.
fn status_error(status: StatusCode, body_text: &str) -> RemoteError {
    let base = status_message(status);
    let detail = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| {
            let trimmed = body_text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });
    let message = match detail {
        Some(detail) if detail != base => format!("{base}: {detail}"),
        _ => base,
    };
    RemoteError::Status {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// PostgREST query encoding
// ---------------------------------------------------------------------------

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Encode one filter as a `(column, operator.value)` query pair.
fn filter_param(filter: &Filter) -> (String, String) {
    match filter {
        Filter::Eq(column, Value::Null) => (column.clone(), "is.null".to_string()),
        Filter::Eq(column, value) => (column.clone(), format!("eq.{}", render_value(value))),
        Filter::Gte(column, value) => (column.clone(), format!("gte.{}", render_value(value))),
        Filter::Lt(column, value) => (column.clone(), format!("lt.{}", render_value(value))),
    }
}

fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = Vec::with_capacity(query.filters.len() + 2);
    params.push((
        "select".to_string(),
        query
            .select
            .as_deref()
            .unwrap_or("*")
            .replace(' ', ""),
    ));
    params.extend(query.filters.iter().map(filter_param));
    if let Some((column, ascending)) = &query.order {
        let direction = if *ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{column}.{direction}")));
    }
    params
}

// ---------------------------------------------------------------------------
// REST remote
// ---------------------------------------------------------------------------

pub struct RestRemote {
    base_url: String,
    api_key: Zeroizing<String>,
    access_token: Option<Zeroizing<String>>,
    client: Client,
    probe_client: Client,
}

impl RestRemote {
    pub fn new(
        base_url: &str,
        api_key: &str,
        access_token: Option<&str>,
    ) -> Result<Self, RemoteError> {
        if api_key.trim().is_empty() {
            return Err(RemoteError::NotConfigured("api key"));
        }
        let base_url = normalize_remote_url(base_url);
        Url::parse(&base_url)
            .map_err(|e| RemoteError::Transport(format!("Invalid remote datastore URL: {e}")))?;

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {e}")))?;
        let probe_client = Client::builder()
            .timeout(CONNECTIVITY_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            api_key: Zeroizing::new(api_key.trim().to_string()),
            access_token: access_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| Zeroizing::new(t.to_string())),
            client,
            probe_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: Table, params: &[(String, String)]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, table.as_str()))
            .map_err(|e| RemoteError::Transport(format!("Invalid remote datastore URL: {e}")))?;
        if !params.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in params {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn id_params(id: &str) -> Vec<(String, String)> {
        vec![("id".to_string(), format!("eq.{id}"))]
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .access_token
            .as_ref()
            .map(|t| t.as_str())
            .unwrap_or(self.api_key.as_str());
        req.header("apikey", self.api_key.as_str())
            .bearer_auth(bearer)
            .header("Content-Type", "application/json")
    }

    /// Send a request and return the JSON body, or `Value::Null` for an
    /// empty response.
    async fn send(&self, req: RequestBuilder) -> Result<Value, RemoteError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(status_error(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| RemoteError::Payload(format!("invalid JSON from remote: {e}")))
    }
}

fn into_rows(body: Value) -> Vec<Value> {
    match body {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait]
impl RemoteStore for RestRemote {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table, &query_params(query))?;
        debug!(table = table.as_str(), "remote select");
        Ok(into_rows(self.send(self.client.get(url)).await?))
    }

    async fn insert(
        &self,
        table: Table,
        rows: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table, &[])?;
        let mut req = self
            .client
            .post(url)
            .header("Prefer", "return=representation")
            .json(&rows);
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        debug!(table = table.as_str(), "remote insert");
        Ok(into_rows(self.send(req).await?))
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<(), RemoteError> {
        let url = self.table_url(table, &Self::id_params(id))?;
        debug!(table = table.as_str(), id, "remote update");
        self.send(self.client.patch(url).json(&patch)).await?;
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        let url = self.table_url(table, &Self::id_params(id))?;
        debug!(table = table.as_str(), id, "remote delete");
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn rpc(&self, function: &str, body: Value) -> Result<Value, RemoteError> {
        let url = format!("{}/functions/v1/{function}", self.base_url);
        debug!(function, "remote function call");
        self.send(self.client.post(url).json(&body)).await
    }

    async fn health(&self) -> Result<(), RemoteError> {
        let url = format!("{}/rest/v1/", self.base_url);
        let start = Instant::now();
        let resp = self
            .authorize(self.probe_client.get(&url))
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        if status.is_success() {
            info!(
                latency_ms = start.elapsed().as_millis() as u64,
                "connectivity probe passed"
            );
            Ok(())
        } else {
            Err(status_error(status, ""))
        }
    }
}
