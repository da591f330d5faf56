//! Records shared by the local store, the cache managers and the remote.
//!
//! Field names match the remote column names so the same serde shape is used
//! for local JSON rows and REST payloads.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

fn default_true() -> bool {
    true
}

/// Format a timestamp the way every persisted and remote timestamp is written.
pub fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: String,
    pub name: String,
    pub quantity: i64,
    #[serde(default)]
    pub purchase_price: f64,
    #[serde(default)]
    pub sale_price: f64,
    #[serde(default)]
    pub mfg_date: Option<NaiveDate>,
    #[serde(default)]
    pub exp_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Payload for creating an item. Identity, owner and timestamp are assigned
/// by the inventory manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    pub quantity: i64,
    #[serde(default)]
    pub purchase_price: f64,
    #[serde(default)]
    pub sale_price: f64,
    #[serde(default)]
    pub mfg_date: Option<NaiveDate>,
    #[serde(default)]
    pub exp_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Partial update. Only the fields present are merged locally and sent to
/// the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfg_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl ItemPatch {
    pub fn quantity(quantity: i64) -> Self {
        Self {
            quantity: Some(quantity),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, item: &mut InventoryItem) {
        if let Some(name) = &self.name {
            item.name = name.clone();
        }
        if let Some(quantity) = self.quantity {
            item.quantity = quantity;
        }
        if let Some(price) = self.purchase_price {
            item.purchase_price = price;
        }
        if let Some(price) = self.sale_price {
            item.sale_price = price;
        }
        if let Some(date) = self.mfg_date {
            item.mfg_date = Some(date);
        }
        if let Some(date) = self.exp_date {
            item.exp_date = Some(date);
        }
        if let Some(active) = self.is_active {
            item.is_active = active;
        }
    }
}

// ---------------------------------------------------------------------------
// Invoices and history lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Sale,
    Purchase,
}

impl TransactionType {
    /// Direction of the inventory effect per unit.
    pub fn sign(self) -> i64 {
        match self {
            TransactionType::Purchase => 1,
            TransactionType::Sale => -1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Sale => "sale",
            TransactionType::Purchase => "purchase",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Customer (for sales) or supplier (for purchases).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Party {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Item details captured when the line was written, so history stays
/// readable after the item is edited or deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineSnapshot {
    pub name: String,
    #[serde(default)]
    pub mfg_date: Option<NaiveDate>,
    #[serde(default)]
    pub exp_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryLine {
    pub id: String,
    pub invoice_id: String,
    pub inventory_id: String,
    pub quantity: i64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    #[serde(default)]
    pub purchase_price: Option<f64>,
    #[serde(default)]
    pub sale_price: Option<f64>,
    #[serde(default)]
    pub metadata: LineSnapshot,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl HistoryLine {
    /// Signed stock change this line applied when it was recorded.
    pub fn inventory_effect(&self) -> i64 {
        self.quantity * self.kind.sign()
    }

    /// Unit price that counts towards the invoice total.
    pub fn unit_price(&self) -> f64 {
        match self.kind {
            TransactionType::Sale => self.sale_price.unwrap_or(0.0),
            TransactionType::Purchase => self.purchase_price.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub invoice_number: String,
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default)]
    pub party: Option<Party>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryLine>,
}

impl Invoice {
    pub fn month_key(&self) -> String {
        self.created_at.format("%Y-%m").to_string()
    }

    pub fn computed_total(&self) -> f64 {
        self.history
            .iter()
            .map(|line| line.quantity as f64 * line.unit_price())
            .sum()
    }

    /// Invoice row as sent to the `invoices` table, without embedded lines.
    pub fn header_json(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("history");
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Pending operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Update,
    Delete,
    Checkout,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Add => "add",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Checkout => "checkout",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    Add(InventoryItem),
    Update(ItemPatch),
    Delete,
    Checkout(CheckoutJob),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Add(_) => OperationKind::Add,
            Operation::Update(_) => OperationKind::Update,
            Operation::Delete => OperationKind::Delete,
            Operation::Checkout(_) => OperationKind::Checkout,
        }
    }
}

/// Stock level an item must have once an invoice edit or delete is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockLevel {
    pub item_id: String,
    pub quantity: i64,
}

/// Relative stock change of one item, applied to the remote quantity at
/// replay time. `applied` is set once the remote confirmed it so a retried
/// job never applies the same change twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockChange {
    pub item_id: String,
    pub change: i64,
    #[serde(default)]
    pub applied: bool,
}

impl StockChange {
    pub fn new(item_id: impl Into<String>, change: i64) -> Self {
        Self {
            item_id: item_id.into(),
            change,
            applied: false,
        }
    }

    /// Quantity after applying the change to `current`, floored at zero.
    pub fn apply_to(&self, current: i64) -> i64 {
        (current + self.change).max(0)
    }
}

/// Invoice header plus its embedded lines, and the stock change of every
/// item the lines touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutJob {
    pub invoice: Invoice,
    #[serde(default)]
    pub stock: Vec<StockChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Item id for add/update/delete, invoice id for checkout.
    pub target_id: String,
    pub idempotency_key: String,
    pub operation: Operation,
}

impl PendingOperation {
    pub fn new(target_id: impl Into<String>, operation: Operation) -> Self {
        Self::at(Utc::now(), target_id, operation)
    }

    pub fn at(created_at: DateTime<Utc>, target_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at,
            target_id: target_id.into(),
            idempotency_key: Uuid::new_v4().to_string(),
            operation,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}

// ---------------------------------------------------------------------------
// Month cache and cart
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthHistory {
    /// `YYYY-MM`
    pub month: String,
    pub invoices: Vec<Invoice>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Idle,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub item_id: String,
    pub name: String,
    pub quantity: i64,
    #[serde(default)]
    pub purchase_price: Option<f64>,
    #[serde(default)]
    pub sale_price: Option<f64>,
    #[serde(default)]
    pub mfg_date: Option<NaiveDate>,
    #[serde(default)]
    pub exp_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub lines: Vec<CartLine>,
}
