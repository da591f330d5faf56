//! Month-partitioned invoice cache with stock-consistent edit and delete.
//!
//! Only the most recently fetched month is persisted; memory may hold
//! several. Edits and deletes work against the remote copy of an invoice and
//! adjust item stock by the difference in inventory effect, rejecting the
//! whole operation before any write if a quantity would go negative. They
//! drain the sync queue first and refuse to run while work is still queued,
//! since their stock levels are derived from the remote quantities.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::db::{self, Collection, DbState};
use crate::error::{Error, RemoteError, Result, StorageError};
use crate::inventory::{self, InventoryManager};
use crate::models::{self, Invoice, LoadStatus, MonthHistory, Party, StockLevel, TransactionType};
use crate::network::NetworkStatus;
use crate::remote::{self, Query, RemoteStore, Table};
use crate::sync::{self, SyncProcessor};

pub fn month_key(year: i32, month: u32) -> Result<String> {
    if !(1..=12).contains(&month) {
        return Err(Error::Validation(format!("invalid month {month}")));
    }
    Ok(format!("{year:04}-{month:02}"))
}

/// `[start of month, start of next month)` in UTC.
pub fn month_bounds(year: i32, month: u32) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    month_key(year, month)?;
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single();
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single();
    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(Error::Validation(format!("invalid month {year}-{month}"))),
    }
}

/// Changes to an existing invoice. Lines not listed keep their values but
/// still take the new type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceEdit {
    #[serde(default, rename = "type")]
    pub kind: Option<TransactionType>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub party: Option<Party>,
    #[serde(default)]
    pub lines: Vec<LineEdit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineEdit {
    pub id: String,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub purchase_price: Option<f64>,
    #[serde(default)]
    pub sale_price: Option<f64>,
}

#[derive(Debug, Clone)]
struct MonthEntry {
    status: LoadStatus,
    invoices: Vec<Invoice>,
}

impl Default for MonthEntry {
    fn default() -> Self {
        Self {
            status: LoadStatus::Idle,
            invoices: Vec::new(),
        }
    }
}

fn newest_first(invoices: &mut [Invoice]) {
    invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Add unsynced drafts that the list does not contain yet.
fn merge_drafts(invoices: &mut Vec<Invoice>, drafts: Vec<Invoice>) {
    for draft in drafts {
        if !invoices.iter().any(|inv| inv.id == draft.id) {
            invoices.push(draft);
        }
    }
    newest_first(invoices);
}

fn drafts_for_month(conn: &Connection, key: &str) -> Result<Vec<Invoice>, StorageError> {
    Ok(db::get_all::<Invoice>(conn)?
        .into_iter()
        .filter(|inv| inv.month_key() == key)
        .collect())
}

/// Add a new invoice to the persisted month entry if its month is the one
/// currently persisted.
pub(crate) fn persist_insert(conn: &Connection, invoice: &Invoice) -> Result<(), StorageError> {
    let key = invoice.month_key();
    if let Some(mut month) = db::get::<MonthHistory>(conn, &key)? {
        month.invoices.retain(|inv| inv.id != invoice.id);
        month.invoices.push(invoice.clone());
        newest_first(&mut month.invoices);
        db::put(conn, &month)?;
    }
    Ok(())
}

pub struct HistoryManager {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    network: NetworkStatus,
    inventory: Arc<InventoryManager>,
    processor: Arc<SyncProcessor>,
    user_id: String,
    months: Mutex<HashMap<String, MonthEntry>>,
}

impl HistoryManager {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteStore>,
        network: NetworkStatus,
        inventory: Arc<InventoryManager>,
        processor: Arc<SyncProcessor>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            remote,
            network,
            inventory,
            processor,
            user_id: user_id.into(),
            months: Mutex::new(HashMap::new()),
        }
    }

    fn months(&self) -> MutexGuard<'_, HashMap<String, MonthEntry>> {
        self.months.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// In-memory invoices of a month, newest first. No I/O.
    pub fn cached_month(&self, year: i32, month: u32) -> Result<Vec<Invoice>> {
        let key = month_key(year, month)?;
        Ok(self
            .months()
            .get(&key)
            .map(|entry| entry.invoices.clone())
            .unwrap_or_default())
    }

    pub fn month_status(&self, year: i32, month: u32) -> Result<LoadStatus> {
        let key = month_key(year, month)?;
        Ok(self
            .months()
            .get(&key)
            .map_or(LoadStatus::Idle, |entry| entry.status))
    }

    pub async fn fetch_month(&self, year: i32, month: u32) -> Result<Vec<Invoice>> {
        let key = month_key(year, month)?;
        let (start, end) = month_bounds(year, month)?;

        if !self.network.is_online() {
            let invoices = self.db.with_conn(|conn| {
                let mut invoices = db::get::<MonthHistory>(conn, &key)?
                    .map(|m| m.invoices)
                    .unwrap_or_default();
                merge_drafts(&mut invoices, drafts_for_month(conn, &key)?);
                Ok::<_, StorageError>(invoices)
            })?;
            debug!(month = %key, count = invoices.len(), "Offline; serving persisted month");
            self.months().insert(
                key,
                MonthEntry {
                    status: LoadStatus::Loaded,
                    invoices: invoices.clone(),
                },
            );
            return Ok(invoices);
        }

        {
            let mut months = self.months();
            let entry = months.entry(key.clone()).or_default();
            if entry.status == LoadStatus::Loading {
                debug!(month = %key, "Month fetch already in flight");
                return Ok(entry.invoices.clone());
            }
            entry.status = LoadStatus::Loading;
        }

        match self.load_month(&key, start, end).await {
            Ok(invoices) => {
                self.months().insert(
                    key.clone(),
                    MonthEntry {
                        status: LoadStatus::Loaded,
                        invoices: invoices.clone(),
                    },
                );
                info!(month = %key, count = invoices.len(), "Month history refreshed");
                Ok(invoices)
            }
            Err(e) => {
                if let Some(entry) = self.months().get_mut(&key) {
                    entry.status = LoadStatus::Idle;
                }
                warn!(month = %key, error = %e, "Month history fetch failed");
                Err(e)
            }
        }
    }

    /// Query the remote for one month, then persist it as the only stored
    /// month.
    async fn load_month(
        &self,
        key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Invoice>> {
        let query = Query::new()
            .select("*, history(*)")
            .eq("user_id", self.user_id.as_str())
            .gte("created_at", models::timestamp(&start))
            .lt("created_at", models::timestamp(&end))
            .order("created_at", false);
        let rows = self.remote.select(Table::Invoices, &query).await?;
        let mut invoices: Vec<Invoice> = remote::decode(rows)?;

        let invoices = self.db.transaction(|tx| {
            merge_drafts(&mut invoices, drafts_for_month(tx, key)?);
            db::put(
                tx,
                &MonthHistory {
                    month: key.to_string(),
                    invoices: invoices.clone(),
                    fetched_at: Utc::now(),
                },
            )?;
            let evicted = db::retain_only(tx, Collection::HistoryCache, key)?;
            if evicted > 0 {
                debug!(evicted, kept = %key, "Evicted persisted months");
            }
            Ok::<_, StorageError>(invoices)
        })?;
        Ok(invoices)
    }

    /// Add a freshly created invoice to its month in memory.
    pub(crate) fn patch_insert(&self, invoice: &Invoice) {
        let mut months = self.months();
        let entry = months.entry(invoice.month_key()).or_default();
        entry.invoices.retain(|inv| inv.id != invoice.id);
        entry.invoices.push(invoice.clone());
        newest_first(&mut entry.invoices);
    }

    fn require_online(&self) -> Result<()> {
        if self.network.is_online() {
            Ok(())
        } else {
            Err(RemoteError::Offline.into())
        }
    }

    /// Replay the queue and fail with `SyncPending` if anything is left.
    async fn require_synced(&self) -> Result<()> {
        self.require_online()?;
        self.processor.run().await?;
        let pending = self.db.with_conn(sync::pending_count)?;
        if pending > 0 {
            warn!(pending, "Queued work not yet synced; invoice change refused");
            return Err(Error::SyncPending { pending });
        }
        Ok(())
    }

    async fn fetch_remote_invoice(&self, id: &str) -> Result<Invoice> {
        let query = Query::new().select("*, history(*)").eq("id", id);
        let rows = self.remote.select(Table::Invoices, &query).await?;
        remote::decode::<Invoice>(rows)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("invoice", id))
    }

    /// Resolve per-item stock changes against the remote quantities. Fails
    /// with `InsufficientStock` before anything is written.
    async fn plan_stock(&self, deltas: BTreeMap<String, i64>) -> Result<Vec<StockLevel>> {
        let mut plan = Vec::new();
        for (item_id, delta) in deltas.into_iter().filter(|(_, d)| *d != 0) {
            let query = Query::new().select("id, quantity").eq("id", item_id.as_str());
            let rows = self.remote.select(Table::Inventory, &query).await?;
            let Some(current) = rows
                .first()
                .and_then(|row| row.get("quantity"))
                .and_then(Value::as_i64)
            else {
                warn!(item_id = %item_id, "Item no longer exists remotely; stock not adjusted");
                continue;
            };
            let quantity = current + delta;
            if quantity < 0 {
                return Err(Error::InsufficientStock {
                    item_id,
                    available: current,
                    requested: -delta,
                });
            }
            plan.push(StockLevel { item_id, quantity });
        }
        Ok(plan)
    }

    /// Write planned stock levels to the remote, then to the local store and
    /// memory.
    async fn commit_stock(&self, plan: &[StockLevel]) -> Result<()> {
        for level in plan {
            self.remote
                .update(
                    Table::Inventory,
                    &level.item_id,
                    serde_json::json!({ "quantity": level.quantity }),
                )
                .await?;
        }
        let updated = self.db.transaction(|tx| {
            let mut updated = Vec::new();
            for level in plan {
                if let Some(item) = inventory::set_quantity(tx, &level.item_id, level.quantity)? {
                    updated.push(item);
                }
            }
            Ok::<_, Error>(updated)
        })?;
        self.inventory.apply_quantities(&updated);
        Ok(())
    }

    pub async fn edit_invoice(&self, id: &str, edit: InvoiceEdit) -> Result<Invoice> {
        self.require_synced().await?;
        let original = self.fetch_remote_invoice(id).await?;

        if let Some(number) = &edit.invoice_number {
            if number.trim().is_empty() {
                return Err(Error::Validation("invoice number is required".into()));
            }
        }
        let kind = edit.kind.unwrap_or(original.kind);

        let mut updated = original.clone();
        updated.kind = kind;
        if let Some(number) = &edit.invoice_number {
            updated.invoice_number = number.trim().to_string();
        }
        if edit.party.is_some() {
            updated.party = edit.party.clone();
        }
        for line in &mut updated.history {
            line.kind = kind;
        }
        for change in &edit.lines {
            let line = updated
                .history
                .iter_mut()
                .find(|line| line.id == change.id)
                .ok_or_else(|| Error::not_found("history line", change.id.as_str()))?;
            if let Some(quantity) = change.quantity {
                if quantity <= 0 {
                    return Err(Error::InvalidQuantity {
                        item_id: line.inventory_id.clone(),
                        quantity,
                    });
                }
                line.quantity = quantity;
            }
            if change.purchase_price.is_some() {
                line.purchase_price = change.purchase_price;
            }
            if change.sale_price.is_some() {
                line.sale_price = change.sale_price;
            }
        }

        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        for (old, new) in original.history.iter().zip(&updated.history) {
            *deltas.entry(new.inventory_id.clone()).or_default() +=
                new.inventory_effect() - old.inventory_effect();
        }
        let plan = self.plan_stock(deltas).await?;

        self.commit_stock(&plan).await?;
        for (old, new) in original.history.iter().zip(&updated.history) {
            if old == new {
                continue;
            }
            self.remote
                .update(
                    Table::History,
                    &new.id,
                    serde_json::json!({
                        "quantity": new.quantity,
                        "type": new.kind,
                        "purchase_price": new.purchase_price,
                        "sale_price": new.sale_price,
                    }),
                )
                .await?;
        }
        updated.total_amount = updated.computed_total();
        self.remote
            .update(
                Table::Invoices,
                id,
                serde_json::json!({
                    "type": updated.kind,
                    "invoice_number": updated.invoice_number,
                    "party": updated.party,
                    "total_amount": updated.total_amount,
                }),
            )
            .await?;

        self.replace_cached(&updated)?;
        info!(invoice_id = %id, stock_changes = plan.len(), "Invoice edited");
        Ok(updated)
    }

    /// Swap the cached copy of an edited invoice in memory and in the
    /// persisted month.
    fn replace_cached(&self, invoice: &Invoice) -> Result<()> {
        for entry in self.months().values_mut() {
            if let Some(slot) = entry.invoices.iter_mut().find(|inv| inv.id == invoice.id) {
                *slot = invoice.clone();
            }
        }
        self.db.transaction(|tx| {
            if let Some(mut month) = db::get::<MonthHistory>(tx, &invoice.month_key())? {
                if let Some(slot) = month.invoices.iter_mut().find(|inv| inv.id == invoice.id) {
                    *slot = invoice.clone();
                    db::put(tx, &month)?;
                }
            }
            Ok::<_, StorageError>(())
        })?;
        Ok(())
    }

    pub async fn delete_invoice(&self, id: &str) -> Result<()> {
        self.require_synced().await?;
        let invoice = self.fetch_remote_invoice(id).await?;

        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        for line in &invoice.history {
            *deltas.entry(line.inventory_id.clone()).or_default() -= line.inventory_effect();
        }
        let plan = self.plan_stock(deltas).await?;

        self.commit_stock(&plan).await?;
        for line in &invoice.history {
            self.remote.delete(Table::History, &line.id).await?;
        }
        self.remote.delete(Table::Invoices, id).await?;

        for entry in self.months().values_mut() {
            entry.invoices.retain(|inv| inv.id != id);
        }
        self.db.transaction(|tx| {
            for mut month in db::get_all::<MonthHistory>(tx)? {
                let before = month.invoices.len();
                month.invoices.retain(|inv| inv.id != id);
                if month.invoices.len() != before {
                    db::put(tx, &month)?;
                }
            }
            db::delete(tx, Collection::Invoices, id)?;
            Ok::<_, StorageError>(())
        })?;
        info!(invoice_id = %id, stock_changes = plan.len(), "Invoice deleted");
        Ok(())
    }
}
