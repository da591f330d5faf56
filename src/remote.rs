//! Remote datastore capability.
//!
//! The cache managers and the sync processor only see this trait; the HTTP
//! implementation lives in `api`, and tests use an in-memory double.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Inventory,
    Invoices,
    History,
    Profiles,
    UserDevices,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Inventory => "inventory",
            Table::Invoices => "invoices",
            Table::History => "history",
            Table::Profiles => "profiles",
            Table::UserDevices => "user_devices",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gte(String, Value),
    Lt(String, Value),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _) | Filter::Gte(c, _) | Filter::Lt(c, _) => c,
        }
    }
}

/// Row selection: filters are ANDed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Column list with optional embedded resources, e.g. `*, history(*)`.
    pub select: Option<String>,
    pub filters: Vec<Filter>,
    /// `(column, ascending)`
    pub order: Option<(String, bool)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.select = Some(columns.to_string());
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn gte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(column.to_string(), value.into()));
        self
    }

    pub fn lt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lt(column.to_string(), value.into()));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some((column.to_string(), ascending));
        self
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, RemoteError>;

    /// Insert one row (object) or several (array). Returns the stored rows
    /// including server-assigned fields.
    async fn insert(
        &self,
        table: Table,
        rows: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Vec<Value>, RemoteError>;

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<(), RemoteError>;

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError>;

    /// Call a serverless function by name.
    async fn rpc(&self, function: &str, body: Value) -> Result<Value, RemoteError>;

    /// Lightweight reachability check.
    async fn health(&self) -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// Typed RPC wrappers
// ---------------------------------------------------------------------------

pub const ENFORCE_DEVICE_LIMIT: &str = "enforce-device-limit";
pub const ADMIN_DELETE_USER: &str = "admin-delete-user";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceLimitOutcome {
    #[serde(default)]
    pub enforced: bool,
    #[serde(default)]
    pub evicted_devices: Vec<Value>,
}

pub async fn enforce_device_limit(
    remote: &dyn RemoteStore,
    user_id: &str,
) -> Result<DeviceLimitOutcome, RemoteError> {
    let body = remote
        .rpc(ENFORCE_DEVICE_LIMIT, serde_json::json!({ "user_id": user_id }))
        .await?;
    if body.is_null() {
        return Ok(DeviceLimitOutcome::default());
    }
    serde_json::from_value(body).map_err(|e| RemoteError::Payload(e.to_string()))
}

pub async fn admin_delete_user(remote: &dyn RemoteStore, user_id: &str) -> Result<(), RemoteError> {
    remote
        .rpc(ADMIN_DELETE_USER, serde_json::json!({ "user_id": user_id }))
        .await?;
    Ok(())
}

/// Decode rows returned by the remote into typed records.
pub fn decode<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, RemoteError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|e| RemoteError::Payload(e.to_string())))
        .collect()
}
