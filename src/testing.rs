//! In-memory remote and fixtures shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::db::DbState;
use crate::error::RemoteError;
use crate::models::InventoryItem;
use crate::network::NetworkStatus;
use crate::remote::{Filter, Query, RemoteStore, Table};
use crate::Stockbook;

pub const USER: &str = "u1";

/// Remote double backed by per-table row lists. Tables can be switched to
/// fail, and every attempted write is recorded in `calls()`.
#[derive(Default)]
pub struct MemoryRemote {
    tables: Mutex<HashMap<Table, Vec<Value>>>,
    failing: Mutex<HashSet<Table>>,
    unreachable: AtomicBool,
    calls: Mutex<Vec<String>>,
    insert_keys: Mutex<Vec<String>>,
    rpc_responses: Mutex<HashMap<String, Value>>,
    rpc_calls: Mutex<Vec<String>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: Table, row: Value) {
        self.tables
            .lock()
            .unwrap()
            .entry(table)
            .or_default()
            .push(row);
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, table: Table, id: &str) -> Option<Value> {
        self.rows(table).into_iter().find(|row| row["id"] == id)
    }

    pub fn fail(&self, table: Table) {
        self.failing.lock().unwrap().insert(table);
    }

    pub fn heal(&self, table: Table) {
        self.failing.lock().unwrap().remove(&table);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, AtomicOrdering::SeqCst);
    }

    /// Attempted writes, e.g. `insert:inventory:i1` or `update:inventory:i1`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn insert_keys(&self) -> Vec<String> {
        self.insert_keys.lock().unwrap().clone()
    }

    pub fn set_rpc_response(&self, function: &str, body: Value) {
        self.rpc_responses
            .lock()
            .unwrap()
            .insert(function.to_string(), body);
    }

    pub fn rpc_calls(&self) -> Vec<String> {
        self.rpc_calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, table: Table) -> Result<(), RemoteError> {
        if self.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        if self.failing.lock().unwrap().contains(&table) {
            return Err(RemoteError::Status {
                status: 503,
                message: "Remote server error".into(),
            });
        }
        Ok(())
    }
}

fn compare(value: Option<&Value>, bound: &Value) -> Option<Ordering> {
    let value = value?;
    if let (Some(a), Some(b)) = (value.as_f64(), bound.as_f64()) {
        return a.partial_cmp(&b);
    }
    let (a, b) = (value.as_str()?, bound.as_str()?);
    match (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(a), Ok(b)) => Some(a.cmp(&b)),
        _ => Some(a.cmp(b)),
    }
}

fn matches(row: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(column, value) => row.get(column) == Some(value),
        Filter::Gte(column, value) => {
            matches!(compare(row.get(column), value), Some(o) if o != Ordering::Less)
        }
        Filter::Lt(column, value) => compare(row.get(column), value) == Some(Ordering::Less),
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, RemoteError> {
        self.check(table)?;
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<Value> = tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|f| matches(row, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let embeds_history = query
            .select
            .as_deref()
            .is_some_and(|s| s.contains("history("));
        if table == Table::Invoices && embeds_history {
            let lines = tables.get(&Table::History).cloned().unwrap_or_default();
            for row in &mut rows {
                let embedded: Vec<Value> = lines
                    .iter()
                    .filter(|line| line["invoice_id"] == row["id"])
                    .cloned()
                    .collect();
                row["history"] = Value::Array(embedded);
            }
        }

        if let Some((column, ascending)) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(column), &b[column]).unwrap_or(Ordering::Equal);
                if *ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        Ok(rows)
    }

    async fn insert(
        &self,
        table: Table,
        rows: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Vec<Value>, RemoteError> {
        let mut rows = match rows {
            Value::Array(rows) => rows,
            row => vec![row],
        };
        for row in &mut rows {
            if row.get("id").map_or(true, Value::is_null) {
                row["id"] = Value::String(uuid::Uuid::new_v4().to_string());
            }
        }
        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        self.record(format!("insert:{}:{}", table.as_str(), ids.join(",")));
        self.check(table)?;

        if let Some(key) = idempotency_key {
            self.insert_keys.lock().unwrap().push(key.to_string());
        }
        self.tables
            .lock()
            .unwrap()
            .entry(table)
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<(), RemoteError> {
        self.record(format!("update:{}:{id}", table.as_str()));
        self.check(table)?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.get_mut(&table) {
            for row in rows.iter_mut().filter(|row| row["id"] == id) {
                if let (Value::Object(target), Value::Object(fields)) = (row, &patch) {
                    for (k, v) in fields {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        self.record(format!("delete:{}:{id}", table.as_str()));
        self.check(table)?;
        if let Some(rows) = self.tables.lock().unwrap().get_mut(&table) {
            rows.retain(|row| row["id"] != id);
        }
        Ok(())
    }

    async fn rpc(&self, function: &str, _body: Value) -> Result<Value, RemoteError> {
        self.rpc_calls.lock().unwrap().push(function.to_string());
        if self.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        Ok(self
            .rpc_responses
            .lock()
            .unwrap()
            .get(function)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn health(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub struct Harness {
    pub app: Stockbook,
    pub remote: Arc<MemoryRemote>,
    pub network: NetworkStatus,
    pub db: Arc<DbState>,
}

impl Harness {
    pub fn new(online: bool) -> Self {
        let db = Arc::new(DbState::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let network = NetworkStatus::new(online);
        let app = Stockbook::new(db.clone(), remote.clone(), network.clone(), USER);
        Self {
            app,
            remote,
            network,
            db,
        }
    }

    /// Put an item on the remote and in the local cache.
    pub fn with_item(&self, item: InventoryItem) {
        self.remote
            .seed(Table::Inventory, serde_json::to_value(&item).unwrap());
        self.db
            .with_conn(|conn| crate::db::put(conn, &item))
            .unwrap();
        self.app.inventory().load_cached().unwrap();
    }

    pub fn local_quantity(&self, id: &str) -> Option<i64> {
        self.db
            .with_conn(|conn| crate::db::get::<InventoryItem>(conn, id))
            .unwrap()
            .map(|item| item.quantity)
    }

    pub fn remote_quantity(&self, id: &str) -> Option<i64> {
        self.remote
            .row(Table::Inventory, id)
            .and_then(|row| row["quantity"].as_i64())
    }

    pub fn queued(&self) -> usize {
        self.db
            .with_conn(|conn| crate::db::count(conn, crate::db::Collection::SyncQueue))
            .unwrap()
    }
}

pub fn item(id: &str, name: &str, quantity: i64) -> InventoryItem {
    item_at(id, name, quantity, Utc::now())
}

pub fn item_at(id: &str, name: &str, quantity: i64, created_at: DateTime<Utc>) -> InventoryItem {
    InventoryItem {
        id: id.into(),
        name: name.into(),
        quantity,
        purchase_price: 4.0,
        sale_price: 10.0,
        mfg_date: None,
        exp_date: None,
        is_active: true,
        user_id: USER.into(),
        created_at,
    }
}
