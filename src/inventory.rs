//! Inventory cache manager.
//!
//! Local writes always land first (store and memory), then the remote is
//! tried. Anything the remote did not confirm goes to the pending queue.
//! Direct remote writes are only attempted while the queue is empty so they
//! never overtake queued work.

use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, Collection, DbState};
use crate::error::{Error, Result, StorageError};
use crate::models::{InventoryItem, ItemPatch, NewItem, Operation, PendingOperation};
use crate::network::NetworkStatus;
use crate::profile;
use crate::remote::{self, Query, RemoteStore, Table};
use crate::sync::{self, SyncProcessor};

/// Name order, case-insensitive, ties broken by id.
pub fn sort_items(items: &mut [InventoryItem]) {
    items.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Replay queued operations over a freshly fetched remote set so
/// unconfirmed local changes stay visible.
fn overlay_pending(mut items: Vec<InventoryItem>, queued: &[PendingOperation]) -> Vec<InventoryItem> {
    for op in queued {
        match &op.operation {
            Operation::Add(item) => {
                items.retain(|existing| existing.id != item.id);
                items.push(item.clone());
            }
            Operation::Update(patch) => {
                if let Some(item) = items.iter_mut().find(|i| i.id == op.target_id) {
                    patch.apply_to(item);
                }
            }
            Operation::Delete => items.retain(|i| i.id != op.target_id),
            Operation::Checkout(job) => {
                for change in job.stock.iter().filter(|c| !c.applied) {
                    if let Some(item) = items.iter_mut().find(|i| i.id == change.item_id) {
                        item.quantity = change.apply_to(item.quantity);
                    }
                }
            }
        }
    }
    items
}

/// Write an absolute quantity inside the caller's transaction. Returns
/// `None` when the item is not cached locally.
pub(crate) fn set_quantity(
    conn: &Connection,
    id: &str,
    quantity: i64,
) -> Result<Option<InventoryItem>> {
    if quantity < 0 {
        return Err(Error::InvalidQuantity {
            item_id: id.to_string(),
            quantity,
        });
    }
    let Some(mut item) = db::get::<InventoryItem>(conn, id)? else {
        return Ok(None);
    };
    item.quantity = quantity;
    db::put(conn, &item)?;
    Ok(Some(item))
}

pub struct InventoryManager {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    network: NetworkStatus,
    processor: Arc<SyncProcessor>,
    user_id: String,
    items: Mutex<Vec<InventoryItem>>,
}

impl InventoryManager {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteStore>,
        network: NetworkStatus,
        processor: Arc<SyncProcessor>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            remote,
            network,
            processor,
            user_id: user_id.into(),
            items: Mutex::new(Vec::new()),
        }
    }

    fn memory(&self) -> MutexGuard<'_, Vec<InventoryItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, mut items: Vec<InventoryItem>) -> Vec<InventoryItem> {
        sort_items(&mut items);
        *self.memory() = items.clone();
        items
    }

    fn upsert_memory(&self, item: InventoryItem) {
        let mut items = self.memory();
        items.retain(|existing| existing.id != item.id);
        items.push(item);
        sort_items(&mut items);
    }

    /// Patch memory after quantities were committed to the store.
    pub(crate) fn apply_quantities(&self, updated: &[InventoryItem]) {
        let mut items = self.memory();
        for item in updated {
            match items.iter_mut().find(|existing| existing.id == item.id) {
                Some(existing) => existing.quantity = item.quantity,
                None => items.push(item.clone()),
            }
        }
        sort_items(&mut items);
    }

    /// In-memory items in display order.
    pub fn cached(&self) -> Vec<InventoryItem> {
        self.memory().clone()
    }

    pub fn get(&self, id: &str) -> Option<InventoryItem> {
        self.memory().iter().find(|item| item.id == id).cloned()
    }

    /// Publish the persisted cache into memory without touching the remote.
    pub fn load_cached(&self) -> Result<Vec<InventoryItem>> {
        let stored = self.db.with_conn(db::get_all::<InventoryItem>)?;
        Ok(self.publish(stored))
    }

    /// Refresh from the remote when online; the remote set replaces the
    /// local collection, with still-queued local changes replayed on top.
    pub async fn load_all(&self) -> Result<Vec<InventoryItem>> {
        let cached = self.load_cached()?;
        if !self.network.is_online() {
            debug!(count = cached.len(), "Offline; serving cached inventory");
            return Ok(cached);
        }

        let query = Query::new().eq("user_id", self.user_id.as_str());
        let rows = self.remote.select(Table::Inventory, &query).await?;
        let fetched: Vec<InventoryItem> = remote::decode(rows)?;
        let fetched_count = fetched.len();

        let merged = self.db.transaction(|tx| {
            let queued = sync::pending(tx)?;
            let merged = overlay_pending(fetched, &queued);
            db::clear(tx, Collection::Inventory)?;
            for item in &merged {
                db::put(tx, item)?;
            }
            Ok::<_, StorageError>(merged)
        })?;

        info!(
            fetched = fetched_count,
            cached = merged.len(),
            "Inventory refreshed from remote"
        );
        Ok(self.publish(merged))
    }

    pub async fn add(&self, new: NewItem) -> Result<InventoryItem> {
        let id = Uuid::new_v4().to_string();
        if new.quantity < 0 {
            return Err(Error::InvalidQuantity {
                item_id: id,
                quantity: new.quantity,
            });
        }

        let tier = profile::current_tier(
            &self.db,
            self.remote.as_ref(),
            &self.network,
            &self.user_id,
        )
        .await;
        let count = self
            .db
            .with_conn(|conn| db::count(conn, Collection::Inventory))?;
        if count >= tier.item_limit() {
            return Err(Error::LimitExceeded {
                limit: tier.item_limit(),
                tier: tier.as_str().to_string(),
            });
        }

        let item = InventoryItem {
            id,
            name: new.name,
            quantity: new.quantity,
            purchase_price: new.purchase_price,
            sale_price: new.sale_price,
            mfg_date: new.mfg_date,
            exp_date: new.exp_date,
            is_active: new.is_active,
            user_id: self.user_id.clone(),
            created_at: chrono::Utc::now(),
        };
        self.db.with_conn(|conn| db::put(conn, &item))?;
        self.upsert_memory(item.clone());
        info!(item_id = %item.id, name = %item.name, "Item added");

        let op = PendingOperation::new(item.id.clone(), Operation::Add(item.clone()));
        if self.confirm_or_enqueue(op).await? {
            self.reload_after_write().await;
        }
        Ok(self.get(&item.id).unwrap_or(item))
    }

    pub async fn update(&self, id: &str, patch: ItemPatch) -> Result<InventoryItem> {
        if let Some(quantity) = patch.quantity.filter(|q| *q < 0) {
            return Err(Error::InvalidQuantity {
                item_id: id.to_string(),
                quantity,
            });
        }

        let updated = self.db.with_conn(|conn| {
            let mut item = db::get::<InventoryItem>(conn, id)?
                .ok_or_else(|| Error::not_found("item", id))?;
            patch.apply_to(&mut item);
            db::put(conn, &item)?;
            Ok::<_, Error>(item)
        })?;
        self.upsert_memory(updated.clone());
        debug!(item_id = %id, "Item updated locally");

        let op = PendingOperation::new(id, Operation::Update(patch));
        if self.confirm_or_enqueue(op).await? {
            self.reload_after_write().await;
        }
        Ok(self.get(id).unwrap_or(updated))
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = self
            .db
            .with_conn(|conn| db::delete(conn, Collection::Inventory, id))?;
        if !removed {
            return Err(Error::not_found("item", id));
        }
        self.memory().retain(|item| item.id != id);
        info!(item_id = %id, "Item deleted locally");

        let op = PendingOperation::new(id, Operation::Delete);
        if self.confirm_or_enqueue(op).await? {
            self.reload_after_write().await;
        }
        Ok(())
    }

    /// Try the remote directly, else queue. Returns `true` when the remote
    /// confirmed the write.
    async fn confirm_or_enqueue(&self, mut op: PendingOperation) -> Result<bool, StorageError> {
        if self.network.is_online() {
            let backlog = self.db.with_conn(sync::pending_count)?;
            if backlog == 0 {
                match sync::apply_operation(self.remote.as_ref(), &mut op).await {
                    Ok(()) => return Ok(true),
                    Err(e) => warn!(
                        kind = %op.kind(),
                        target_id = %op.target_id,
                        error = %e,
                        "Remote write failed; queuing"
                    ),
                }
            } else {
                debug!(backlog, "Queue not empty; queuing behind it");
            }
        }

        self.db.with_conn(|conn| sync::enqueue(conn, &op))?;
        if self.network.is_online() {
            self.processor.request_run();
        }
        Ok(false)
    }

    async fn reload_after_write(&self) {
        if let Err(e) = self.load_all().await {
            warn!(error = %e, "Inventory reload after remote write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationKind;
    use crate::testing::{item, Harness};

    fn new_item(name: &str, quantity: i64) -> NewItem {
        NewItem {
            name: name.into(),
            quantity,
            purchase_price: 4.0,
            sale_price: 10.0,
            mfg_date: None,
            exp_date: None,
            is_active: true,
        }
    }

    fn queued_kinds(h: &Harness) -> Vec<OperationKind> {
        h.db.with_conn(sync::pending)
            .unwrap()
            .iter()
            .map(PendingOperation::kind)
            .collect()
    }

    #[tokio::test]
    async fn test_add_rejected_at_free_limit() {
        let h = Harness::new(false);
        for i in 0..profile::FREE_ITEM_LIMIT {
            h.db.with_conn(|conn| db::put(conn, &item(&format!("i{i}"), "Stock", 1)))
                .unwrap();
        }

        let err = h.app.inventory().add(new_item("One more", 1)).await.unwrap_err();
        assert!(matches!(err, Error::LimitExceeded { limit: 20, .. }));
        assert_eq!(
            h.db.with_conn(|conn| db::count(conn, Collection::Inventory)).unwrap(),
            profile::FREE_ITEM_LIMIT
        );
        assert_eq!(h.queued(), 0);
    }

    #[tokio::test]
    async fn test_premium_tier_raises_limit() {
        let h = Harness::new(true);
        h.remote.seed(
            Table::Profiles,
            serde_json::json!({ "id": "u1", "subscription_tier": "premium" }),
        );
        for i in 0..profile::FREE_ITEM_LIMIT {
            h.db.with_conn(|conn| db::put(conn, &item(&format!("i{i}"), "Stock", 1)))
                .unwrap();
        }

        let added = h.app.inventory().add(new_item("One more", 1)).await.unwrap();
        assert!(h.remote.row(Table::Inventory, &added.id).is_some());
    }

    #[tokio::test]
    async fn test_negative_quantities_rejected_before_write() {
        let h = Harness::new(false);
        h.with_item(item("i1", "Widget", 4));

        let err = h.app.inventory().add(new_item("Bad", -1)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidQuantity { quantity: -1, .. }));

        let err = h
            .app
            .inventory()
            .update("i1", ItemPatch::quantity(-2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuantity { quantity: -2, .. }));
        assert_eq!(h.local_quantity("i1"), Some(4));
        assert_eq!(h.queued(), 0);
    }

    #[tokio::test]
    async fn test_offline_writes_are_optimistic_and_queued() {
        let h = Harness::new(false);
        h.with_item(item("i1", "Widget", 4));
        let inventory = h.app.inventory();

        let added = inventory.add(new_item("Bolt", 9)).await.unwrap();
        inventory.update("i1", ItemPatch::quantity(2)).await.unwrap();
        inventory.delete(&added.id).await.unwrap();

        assert_eq!(inventory.get("i1").map(|i| i.quantity), Some(2));
        assert!(inventory.get(&added.id).is_none());
        assert_eq!(h.local_quantity("i1"), Some(2));
        assert_eq!(
            queued_kinds(&h),
            vec![
                OperationKind::Add,
                OperationKind::Update,
                OperationKind::Delete
            ]
        );
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_online_add_confirms_and_reloads() {
        let h = Harness::new(true);
        let added = h.app.inventory().add(new_item("Bolt", 9)).await.unwrap();

        assert_eq!(h.queued(), 0);
        let row = h.remote.row(Table::Inventory, &added.id).expect("remote row");
        assert_eq!(row["quantity"], 9);
        assert_eq!(h.app.inventory().cached().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_queue() {
        let h = Harness::new(true);
        h.remote.fail(Table::Inventory);

        let added = h.app.inventory().add(new_item("Bolt", 9)).await.unwrap();
        assert_eq!(h.local_quantity(&added.id), Some(9));
        assert_eq!(queued_kinds(&h), vec![OperationKind::Add]);
    }

    #[tokio::test]
    async fn test_direct_write_waits_behind_backlog() {
        let h = Harness::new(false);
        h.with_item(item("i1", "Widget", 4));
        h.app
            .inventory()
            .update("i1", ItemPatch::quantity(3))
            .await
            .unwrap();

        h.network.set_online(true);
        h.app
            .inventory()
            .update("i1", ItemPatch::quantity(1))
            .await
            .unwrap();

        assert!(h.remote.calls().is_empty(), "no write may overtake the queue");
        assert_eq!(queued_kinds(&h).len(), 2);

        h.app.processor().run().await.unwrap();
        assert_eq!(h.remote_quantity("i1"), Some(1));
    }

    #[tokio::test]
    async fn test_update_unknown_item_is_not_found() {
        let h = Harness::new(false);
        let err = h
            .app
            .inventory()
            .update("missing", ItemPatch::quantity(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "item", .. }));
        assert!(matches!(
            h.app.inventory().delete("missing").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_all_replaces_cache_with_remote_set() {
        let h = Harness::new(true);
        h.db.with_conn(|conn| db::put(conn, &item("stale", "Old", 1)))
            .unwrap();
        h.remote.seed(
            Table::Inventory,
            serde_json::to_value(item("i2", "Fresh", 5)).unwrap(),
        );

        let items = h.app.inventory().load_all().await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i2"]);
        assert_eq!(h.local_quantity("stale"), None);
        assert_eq!(h.local_quantity("i2"), Some(5));
    }

    #[tokio::test]
    async fn test_load_all_keeps_queued_changes_visible() {
        let h = Harness::new(false);
        h.with_item(item("i1", "Widget", 4));
        let added = h.app.inventory().add(new_item("Bolt", 9)).await.unwrap();
        h.app
            .inventory()
            .update("i1", ItemPatch::quantity(2))
            .await
            .unwrap();

        h.network.set_online(true);
        let items = h.app.inventory().load_all().await.unwrap();

        assert!(items.iter().any(|i| i.id == added.id));
        assert_eq!(h.local_quantity("i1"), Some(2));
        assert_eq!(h.remote_quantity("i1"), Some(4));
    }

    #[test]
    fn test_overlay_applies_unconfirmed_checkout_changes() {
        let invoice = crate::models::Invoice {
            id: "inv1".into(),
            user_id: crate::testing::USER.into(),
            kind: crate::models::TransactionType::Sale,
            invoice_number: "S-1".into(),
            total_amount: 0.0,
            party: None,
            created_at: chrono::Utc::now(),
            history: vec![],
        };
        let mut confirmed = crate::models::StockChange::new("i2", -1);
        confirmed.applied = true;
        let job = crate::models::CheckoutJob {
            invoice,
            stock: vec![crate::models::StockChange::new("i1", -3), confirmed],
        };
        let queued = vec![PendingOperation::new("inv1", Operation::Checkout(job))];

        // Another device restocked i1 to 12 since the sale.
        let fetched = vec![item("i1", "Widget", 12), item("i2", "Bolt", 5)];
        let merged = overlay_pending(fetched, &queued);

        assert_eq!(merged[0].quantity, 9);
        assert_eq!(merged[1].quantity, 5, "confirmed change is already remote");
    }

    #[tokio::test]
    async fn test_load_all_online_failure_surfaces() {
        let h = Harness::new(true);
        h.with_item(item("i1", "Widget", 4));
        h.remote.fail(Table::Inventory);

        let err = h.app.inventory().load_all().await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        assert_eq!(h.app.inventory().cached().len(), 1, "cache still served");
    }

    #[test]
    fn test_sort_is_case_insensitive_with_id_tiebreak() {
        let mut items = vec![
            item("3", "cherry", 1),
            item("2", "banana", 1),
            item("1", "Apple", 1),
            item("0", "apple", 1),
        ];
        sort_items(&mut items);
        let order: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(order, vec!["0", "1", "2", "3"]);
    }
}
