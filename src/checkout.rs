//! Cart handling and checkout.
//!
//! A checkout turns the persisted cart into one invoice with one history
//! line per cart line. Everything local happens in a single transaction: the
//! draft invoice, the queued `checkout` job, the stock changes, the month
//! cache patch and clearing the cart.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::db::{self, DbState, CART_KEY};
use crate::error::{Error, Result};
use crate::history::{self, HistoryManager};
use crate::inventory::{self, InventoryManager};
use crate::models::{
    Cart, CartLine, CheckoutJob, HistoryLine, InventoryItem, Invoice, LineSnapshot, Operation,
    Party, PendingOperation, StockChange, TransactionType,
};
use crate::network::NetworkStatus;
use crate::sync::{self, SyncProcessor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub invoice_number: String,
    #[serde(default)]
    pub party: Option<Party>,
}

pub struct CheckoutService {
    db: Arc<DbState>,
    network: NetworkStatus,
    inventory: Arc<InventoryManager>,
    history: Arc<HistoryManager>,
    processor: Arc<SyncProcessor>,
    user_id: String,
}

fn snapshot(kind: TransactionType, line: &CartLine, item: &InventoryItem) -> LineSnapshot {
    let name = if line.name.trim().is_empty() {
        item.name.clone()
    } else {
        line.name.clone()
    };
    match kind {
        TransactionType::Purchase => LineSnapshot {
            name,
            mfg_date: line.mfg_date.or(item.mfg_date),
            exp_date: line.exp_date.or(item.exp_date),
        },
        TransactionType::Sale => LineSnapshot {
            name,
            ..LineSnapshot::default()
        },
    }
}

impl CheckoutService {
    pub fn new(
        db: Arc<DbState>,
        network: NetworkStatus,
        inventory: Arc<InventoryManager>,
        history: Arc<HistoryManager>,
        processor: Arc<SyncProcessor>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            network,
            inventory,
            history,
            processor,
            user_id: user_id.into(),
        }
    }

    pub fn cart(&self) -> Result<Cart> {
        let cart = self.db.with_conn(|conn| db::get::<Cart>(conn, CART_KEY))?;
        Ok(cart.unwrap_or_default())
    }

    fn update_cart(&self, f: impl FnOnce(&mut Cart) -> Result<()>) -> Result<Cart> {
        self.db.transaction(|tx| {
            let mut cart = db::get::<Cart>(tx, CART_KEY)?.unwrap_or_default();
            f(&mut cart)?;
            db::put(tx, &cart)?;
            Ok(cart)
        })
    }

    /// Add a line, merging the quantity into an existing line for the same
    /// item.
    pub fn add_line(&self, line: CartLine) -> Result<Cart> {
        if line.quantity <= 0 {
            return Err(Error::InvalidQuantity {
                item_id: line.item_id,
                quantity: line.quantity,
            });
        }
        self.update_cart(|cart| {
            match cart.lines.iter_mut().find(|l| l.item_id == line.item_id) {
                Some(existing) => {
                    existing.quantity += line.quantity;
                    if line.purchase_price.is_some() {
                        existing.purchase_price = line.purchase_price;
                    }
                    if line.sale_price.is_some() {
                        existing.sale_price = line.sale_price;
                    }
                }
                None => cart.lines.push(line),
            }
            Ok(())
        })
    }

    pub fn set_line_quantity(&self, item_id: &str, quantity: i64) -> Result<Cart> {
        if quantity <= 0 {
            return Err(Error::InvalidQuantity {
                item_id: item_id.to_string(),
                quantity,
            });
        }
        self.update_cart(|cart| {
            let line = cart
                .lines
                .iter_mut()
                .find(|l| l.item_id == item_id)
                .ok_or_else(|| Error::not_found("cart line", item_id))?;
            line.quantity = quantity;
            Ok(())
        })
    }

    pub fn remove_line(&self, item_id: &str) -> Result<Cart> {
        self.update_cart(|cart| {
            cart.lines.retain(|l| l.item_id != item_id);
            Ok(())
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.update_cart(|cart| {
            cart.lines.clear();
            Ok(())
        })?;
        Ok(())
    }

    pub fn checkout(&self, request: CheckoutRequest) -> Result<Invoice> {
        let invoice_number = request.invoice_number.trim().to_string();
        if invoice_number.is_empty() {
            return Err(Error::Validation("invoice number is required".into()));
        }
        let kind = request.kind;

        let (invoice, updated) = self.db.transaction(|tx| {
            let cart = db::get::<Cart>(tx, CART_KEY)?.unwrap_or_default();
            if cart.lines.is_empty() {
                return Err(Error::Validation("cart is empty".into()));
            }

            let mut items: BTreeMap<String, InventoryItem> = BTreeMap::new();
            let mut requested: BTreeMap<String, i64> = BTreeMap::new();
            for line in &cart.lines {
                if line.quantity <= 0 {
                    return Err(Error::InvalidQuantity {
                        item_id: line.item_id.clone(),
                        quantity: line.quantity,
                    });
                }
                if !items.contains_key(&line.item_id) {
                    let item = db::get::<InventoryItem>(tx, &line.item_id)?
                        .ok_or_else(|| Error::not_found("item", line.item_id.as_str()))?;
                    items.insert(line.item_id.clone(), item);
                }
                *requested.entry(line.item_id.clone()).or_default() += line.quantity;
            }

            if kind == TransactionType::Sale {
                for (item_id, quantity) in &requested {
                    let available = items[item_id].quantity;
                    if *quantity > available {
                        return Err(Error::InsufficientStock {
                            item_id: item_id.clone(),
                            available,
                            requested: *quantity,
                        });
                    }
                }
            }

            let now = Utc::now();
            let invoice_id = Uuid::new_v4().to_string();
            let history: Vec<HistoryLine> = cart
                .lines
                .iter()
                .map(|line| {
                    let item = &items[&line.item_id];
                    HistoryLine {
                        id: Uuid::new_v4().to_string(),
                        invoice_id: invoice_id.clone(),
                        inventory_id: line.item_id.clone(),
                        quantity: line.quantity,
                        kind,
                        purchase_price: Some(line.purchase_price.unwrap_or(item.purchase_price)),
                        sale_price: Some(line.sale_price.unwrap_or(item.sale_price)),
                        metadata: snapshot(kind, line, item),
                        user_id: self.user_id.clone(),
                        created_at: now,
                    }
                })
                .collect();
            let mut invoice = Invoice {
                id: invoice_id,
                user_id: self.user_id.clone(),
                kind,
                invoice_number: invoice_number.clone(),
                total_amount: 0.0,
                party: request.party.clone(),
                created_at: now,
                history,
            };
            invoice.total_amount = invoice.computed_total();

            let mut stock = Vec::with_capacity(requested.len());
            let mut updated = Vec::with_capacity(requested.len());
            for (item_id, quantity) in &requested {
                let change = StockChange::new(item_id.clone(), kind.sign() * quantity);
                let next = change.apply_to(items[item_id].quantity);
                if let Some(item) = inventory::set_quantity(tx, item_id, next)? {
                    updated.push(item);
                }
                stock.push(change);
            }

            db::put(tx, &invoice)?;
            sync::enqueue(
                tx,
                &PendingOperation::at(
                    now,
                    invoice.id.clone(),
                    Operation::Checkout(CheckoutJob {
                        invoice: invoice.clone(),
                        stock,
                    }),
                ),
            )?;
            history::persist_insert(tx, &invoice)?;
            db::put(tx, &Cart::default())?;
            Ok((invoice, updated))
        })?;

        self.inventory.apply_quantities(&updated);
        self.history.patch_insert(&invoice);
        info!(
            invoice_id = %invoice.id,
            kind = %invoice.kind,
            lines = invoice.history.len(),
            total = invoice.total_amount,
            "Checkout committed"
        );
        if self.network.is_online() {
            self.processor.request_run();
        }
        Ok(invoice)
    }
}
