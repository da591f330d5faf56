//! Pending-operation queue and the processor that replays it.
//!
//! Every local mutation that could not be confirmed remotely is stored in
//! `sync_queue`. The processor drains the queue strictly in order and removes
//! an entry only after the remote confirmed it. A failed job stops the run so
//! later jobs never overtake it; it is retried on the next trigger.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{self, Collection, DbState};
use crate::error::{QueueJobError, RemoteError, StorageError};
use crate::models::{
    self, CheckoutJob, Invoice, MonthHistory, Operation, OperationKind, PendingOperation,
};
use crate::network::NetworkStatus;
use crate::remote::{Query, RemoteStore, Table};

/// Entries beyond this count are dropped oldest first.
pub const MAX_QUEUE_LEN: usize = 200;
/// Entries older than this are dropped regardless of count.
pub const MAX_QUEUE_AGE_DAYS: i64 = 7;

const SETTINGS_CATEGORY: &str = "sync";
const LAST_SYNC_KEY: &str = "last_sync_at";
const EVENT_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Queue helpers
// ---------------------------------------------------------------------------

pub fn enqueue(conn: &Connection, op: &PendingOperation) -> Result<(), StorageError> {
    db::put(conn, op)?;
    debug!(
        job_id = %op.id,
        kind = %op.kind(),
        target_id = %op.target_id,
        "Queued pending operation"
    );
    Ok(())
}

/// Queue contents ordered by creation time, ties by insertion order.
pub fn pending(conn: &Connection) -> Result<Vec<PendingOperation>, StorageError> {
    db::decode_rows(
        conn,
        "SELECT data FROM sync_queue ORDER BY created_at, rowid",
        [],
    )
}

pub fn pending_count(conn: &Connection) -> Result<usize, StorageError> {
    db::count(conn, Collection::SyncQueue)
}

/// Apply the count cap and the age limit. Returns the number of entries
/// removed.
///
/// A dropped checkout never reaches the remote, so its draft invoice is
/// removed with it, from `invoices` and from the persisted month.
pub fn trim_queue(conn: &Connection, now: DateTime<Utc>) -> Result<usize, StorageError> {
    let cutoff = models::timestamp(&(now - ChronoDuration::days(MAX_QUEUE_AGE_DAYS)));
    let rows = {
        let mut stmt = conn.prepare(
            "SELECT key, data, created_at FROM sync_queue ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let (mut overflow, mut expired) = (0usize, 0usize);
    for (index, (key, data, created_at)) in rows.into_iter().enumerate() {
        if index >= MAX_QUEUE_LEN {
            overflow += 1;
        } else if created_at < cutoff {
            expired += 1;
        } else {
            continue;
        }
        db::delete(conn, Collection::SyncQueue, &key)?;
        match serde_json::from_str::<PendingOperation>(&data) {
            Ok(op) => {
                warn!(
                    job_id = %op.id,
                    kind = %op.kind(),
                    target_id = %op.target_id,
                    "Dropped unsynced queue entry"
                );
                if let Operation::Checkout(job) = &op.operation {
                    drop_draft(conn, &job.invoice)?;
                }
            }
            Err(e) => warn!(job_id = %key, error = %e, "Dropped undecodable queue entry"),
        }
    }
    if overflow + expired > 0 {
        info!(overflow, expired, "Trimmed sync queue");
    }
    Ok(overflow + expired)
}

fn drop_draft(conn: &Connection, invoice: &Invoice) -> Result<(), StorageError> {
    db::delete(conn, Collection::Invoices, &invoice.id)?;
    if let Some(mut month) = db::get::<MonthHistory>(conn, &invoice.month_key())? {
        let before = month.invoices.len();
        month.invoices.retain(|inv| inv.id != invoice.id);
        if month.invoices.len() != before {
            db::put(conn, &month)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Remote replay
// ---------------------------------------------------------------------------

fn to_payload<T: Serialize>(value: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::Payload(e.to_string()))
}

/// Send one operation to the remote. Used both for direct writes and for
/// queue replay. Checkout jobs record which stock changes the remote
/// confirmed, so the caller persists `op` again when this fails.
pub(crate) async fn apply_operation(
    remote: &dyn RemoteStore,
    op: &mut PendingOperation,
) -> Result<(), RemoteError> {
    match &mut op.operation {
        Operation::Add(item) => {
            remote
                .insert(Table::Inventory, to_payload(&*item)?, Some(&op.idempotency_key))
                .await?;
        }
        Operation::Update(patch) => {
            remote
                .update(Table::Inventory, &op.target_id, to_payload(&*patch)?)
                .await?;
        }
        Operation::Delete => remote.delete(Table::Inventory, &op.target_id).await?,
        Operation::Checkout(job) => push_checkout(remote, job, &op.idempotency_key).await?,
    }
    Ok(())
}

/// Insert the invoice header, then its lines under the id the remote
/// confirmed, then apply each stock change to the current remote quantity.
///
/// A replay skips whatever an earlier attempt already stored, so a job that
/// failed half-way converges instead of duplicating the invoice or applying
/// a stock change twice.
async fn push_checkout(
    remote: &dyn RemoteStore,
    job: &mut CheckoutJob,
    idempotency_key: &str,
) -> Result<(), RemoteError> {
    let invoice = &job.invoice;
    let existing = remote
        .select(
            Table::Invoices,
            &Query::new()
                .select("id, history(id)")
                .eq("id", invoice.id.as_str()),
        )
        .await?;

    let header_inserted = existing.is_empty();
    let server_id = match existing.first() {
        Some(row) => row
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(&invoice.id)
            .to_string(),
        None => {
            let header = invoice.header_json().map_err(|e| RemoteError::Payload(e.to_string()))?;
            let rows = remote
                .insert(Table::Invoices, header, Some(idempotency_key))
                .await?;
            rows.first()
                .and_then(|row| row.get("id"))
                .and_then(Value::as_str)
                .unwrap_or(&invoice.id)
                .to_string()
        }
    };

    let lines_stored = existing
        .first()
        .and_then(|row| row.get("history"))
        .and_then(Value::as_array)
        .is_some_and(|lines| !lines.is_empty());

    if !lines_stored && !invoice.history.is_empty() {
        let mut lines = Vec::with_capacity(invoice.history.len());
        for line in &invoice.history {
            let mut row = to_payload(line)?;
            row["invoice_id"] = Value::String(server_id.clone());
            lines.push(row);
        }
        let lines_key = format!("{idempotency_key}:lines");
        if let Err(e) = remote
            .insert(Table::History, Value::Array(lines), Some(&lines_key))
            .await
        {
            if header_inserted {
                if let Err(cleanup) = remote.delete(Table::Invoices, &server_id).await {
                    warn!(
                        invoice_id = %server_id,
                        error = %cleanup,
                        "Failed to remove invoice header after line insert failure"
                    );
                }
            }
            return Err(e);
        }
    }

    for change in job.stock.iter_mut().filter(|c| !c.applied) {
        let rows = remote
            .select(
                Table::Inventory,
                &Query::new()
                    .select("id, quantity")
                    .eq("id", change.item_id.as_str()),
            )
            .await?;
        match rows
            .first()
            .and_then(|row| row.get("quantity"))
            .and_then(Value::as_i64)
        {
            Some(current) => {
                if current + change.change < 0 {
                    warn!(
                        item_id = %change.item_id,
                        current,
                        change = change.change,
                        "Remote stock below the synced sale; flooring at zero"
                    );
                }
                remote
                    .update(
                        Table::Inventory,
                        &change.item_id,
                        serde_json::json!({ "quantity": change.apply_to(current) }),
                    )
                    .await?;
            }
            None => warn!(
                item_id = %change.item_id,
                "Item no longer exists remotely; stock change dropped"
            ),
        }
        change.applied = true;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// The run did not start (already running, or offline).
    pub skipped: bool,
    pub processed: usize,
    pub remaining: usize,
    pub trimmed: usize,
    pub failed_job: Option<String>,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A run replayed at least one job and emptied the queue.
    Drained { processed: usize },
    /// A run stopped at a failed job.
    Stopped { job_id: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub last_sync: Option<String>,
    pub running: bool,
    pub online: bool,
}

/// Clears the running flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncProcessor {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    network: NetworkStatus,
    running: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
}

impl SyncProcessor {
    pub fn new(db: Arc<DbState>, remote: Arc<dyn RemoteStore>, network: NetworkStatus) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            remote,
            network,
            running: AtomicBool::new(false),
            events,
            wake: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Ask the background loop for a run as soon as possible. A request made
    /// while no loop is waiting is kept until the next wait.
    pub fn request_run(&self) {
        self.wake.notify_one();
    }

    /// Replay the queue once.
    pub async fn run(&self) -> Result<SyncReport, StorageError> {
        if !self.network.is_online() {
            debug!("Offline; sync run skipped");
            return Ok(SyncReport::skipped());
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync run already in progress");
            return Ok(SyncReport::skipped());
        }
        let _guard = RunGuard(&self.running);

        let trimmed = self.db.transaction(|tx| trim_queue(tx, Utc::now()))?;
        let mut jobs = self.db.with_conn(pending)?;
        let mut report = SyncReport {
            trimmed,
            ..SyncReport::default()
        };

        for job in &mut jobs {
            match apply_operation(self.remote.as_ref(), job).await {
                Ok(()) => {
                    self.db.transaction(|tx| {
                        db::delete(tx, Collection::SyncQueue, &job.id)?;
                        if let Operation::Checkout(checkout) = &job.operation {
                            db::delete(tx, Collection::Invoices, &checkout.invoice.id)?;
                        }
                        Ok::<_, StorageError>(())
                    })?;
                    debug!(job_id = %job.id, kind = %job.kind(), "Replayed queued job");
                    report.processed += 1;
                }
                Err(source) => {
                    let failure = QueueJobError {
                        job_id: job.id.clone(),
                        kind: job.kind(),
                        source,
                    };
                    warn!(error = %failure, "Sync run stopped; job stays queued");
                    if job.kind() == OperationKind::Checkout {
                        let job = &*job;
                        if let Err(e) = self.db.with_conn(|conn| db::put(conn, job)) {
                            warn!(job_id = %job.id, error = %e, "Failed to record checkout progress");
                        }
                    }
                    let _ = self.events.send(SyncEvent::Stopped {
                        job_id: job.id.clone(),
                        error: failure.source.to_string(),
                    });
                    report.failed_job = Some(job.id.clone());
                    break;
                }
            }
        }

        report.remaining = self.db.with_conn(pending_count)?;
        if report.failed_job.is_none() {
            let now = models::timestamp(&Utc::now());
            self.db
                .with_conn(|conn| db::set_setting(conn, SETTINGS_CATEGORY, LAST_SYNC_KEY, &now))?;
            if report.processed > 0 {
                info!(processed = report.processed, "Sync queue drained");
                let _ = self.events.send(SyncEvent::Drained {
                    processed: report.processed,
                });
            }
        }
        Ok(report)
    }

    pub fn queue_status(&self) -> Result<QueueStatus, StorageError> {
        self.db.with_conn(|conn| {
            let pending = pending_count(conn)?;
            let oldest: Option<String> =
                conn.query_row("SELECT MIN(created_at) FROM sync_queue", [], |row| {
                    row.get(0)
                })?;
            let oldest = oldest
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|at| at.with_timezone(&Utc));
            Ok(QueueStatus {
                pending,
                oldest,
                last_sync: db::get_setting(conn, SETTINGS_CATEGORY, LAST_SYNC_KEY),
                running: self.is_running(),
                online: self.network.is_online(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

async fn run_logged(processor: &SyncProcessor) {
    match processor.run().await {
        Ok(report) if report.processed > 0 || report.failed_job.is_some() => {
            info!(
                processed = report.processed,
                remaining = report.remaining,
                "Sync cycle complete"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Sync cycle failed"),
    }
}

/// Start the background sync loop.
///
/// Runs the processor on every offline to online transition, whenever a run
/// is requested, and on each `interval` tick. With a `probe` the tick first
/// checks the remote health endpoint and updates `network` from the result.
pub fn start_sync_loop(
    processor: Arc<SyncProcessor>,
    network: NetworkStatus,
    probe: Option<Arc<dyn RemoteStore>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Sync loop started");
        let mut online_rx = network.subscribe();
        let mut was_online = *online_rx.borrow_and_update();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Sync loop stopped");
                    break;
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !was_online {
                        info!("Network restored; resuming queued sync");
                        was_online = true;
                        run_logged(&processor).await;
                    } else if !online && was_online {
                        info!("Network offline; deferring remote sync and keeping queue pending");
                        was_online = false;
                    }
                }
                _ = processor.wake.notified() => {
                    run_logged(&processor).await;
                }
                _ = ticker.tick() => {
                    if let Some(remote) = &probe {
                        let reachable = remote.health().await.is_ok();
                        network.set_online(reachable);
                    }
                    run_logged(&processor).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        HistoryLine, Invoice, ItemPatch, LineSnapshot, StockChange, TransactionType,
    };
    use crate::testing::{item, item_at, Harness, USER};
    use chrono::{Datelike, TimeZone};

    fn queue(h: &Harness, op: &PendingOperation) {
        h.db.with_conn(|conn| enqueue(conn, op)).unwrap();
    }

    fn checkout_op(invoice_id: &str) -> PendingOperation {
        let created_at = Utc::now();
        let invoice = Invoice {
            id: invoice_id.into(),
            user_id: USER.into(),
            kind: TransactionType::Sale,
            invoice_number: "S-1".into(),
            total_amount: 30.0,
            party: None,
            created_at,
            history: vec![HistoryLine {
                id: "h1".into(),
                invoice_id: invoice_id.into(),
                inventory_id: "i1".into(),
                quantity: 3,
                kind: TransactionType::Sale,
                purchase_price: None,
                sale_price: Some(10.0),
                metadata: LineSnapshot {
                    name: "Widget".into(),
                    ..LineSnapshot::default()
                },
                user_id: USER.into(),
                created_at,
            }],
        };
        PendingOperation::new(
            invoice_id,
            Operation::Checkout(CheckoutJob {
                invoice,
                stock: vec![StockChange::new("i1", -3)],
            }),
        )
    }

    #[tokio::test]
    async fn test_empty_queue_drain_is_noop() {
        let h = Harness::new(true);
        let processor = h.app.processor();

        for _ in 0..2 {
            let report = processor.run().await.unwrap();
            assert!(!report.skipped);
            assert_eq!(report.processed, 0);
            assert_eq!(report.remaining, 0);
        }
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_offline_run_is_skipped() {
        let h = Harness::new(false);
        queue(&h, &PendingOperation::new("i1", Operation::Delete));

        let report = h.app.processor().run().await.unwrap();
        assert!(report.skipped);
        assert_eq!(h.queued(), 1);
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_add_then_update_replayed_in_order() {
        let h = Harness::new(true);
        let t0 = Utc::now();
        let add = PendingOperation::at(t0, "i1", Operation::Add(item_at("i1", "Widget", 1, t0)));
        let update = PendingOperation::at(
            t0 + ChronoDuration::milliseconds(1),
            "i1",
            Operation::Update(ItemPatch::quantity(5)),
        );
        // Stored out of order; replay follows created_at.
        queue(&h, &update);
        queue(&h, &add);

        let report = h.app.processor().run().await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(
            h.remote.calls(),
            vec!["insert:inventory:i1", "update:inventory:i1"]
        );
        assert_eq!(h.remote_quantity("i1"), Some(5));
        assert_eq!(h.remote.insert_keys(), vec![add.idempotency_key.clone()]);
    }

    #[tokio::test]
    async fn test_failed_job_blocks_later_jobs() {
        let h = Harness::new(true);
        let t0 = Utc::now();
        let add = PendingOperation::at(t0, "i1", Operation::Add(item_at("i1", "Widget", 1, t0)));
        let update = PendingOperation::at(
            t0 + ChronoDuration::milliseconds(1),
            "i1",
            Operation::Update(ItemPatch::quantity(5)),
        );
        queue(&h, &add);
        queue(&h, &update);
        h.remote.fail(Table::Inventory);
        let mut events = h.app.processor().subscribe();

        let report = h.app.processor().run().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.failed_job.as_deref(), Some(add.id.as_str()));
        assert_eq!(h.remote.calls(), vec!["insert:inventory:i1"]);
        assert!(matches!(
            events.try_recv(),
            Ok(SyncEvent::Stopped { job_id, .. }) if job_id == add.id
        ));

        h.remote.heal(Table::Inventory);
        let report = h.app.processor().run().await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(h.remote_quantity("i1"), Some(5));
        assert!(matches!(
            events.try_recv(),
            Ok(SyncEvent::Drained { processed: 2 })
        ));
    }

    #[test]
    fn test_trim_keeps_newest_two_hundred() {
        let h = Harness::new(true);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let ops: Vec<PendingOperation> = (0..250)
            .map(|i| {
                PendingOperation::at(
                    now - ChronoDuration::minutes(250 - i),
                    format!("i{i}"),
                    Operation::Delete,
                )
            })
            .collect();
        for op in &ops {
            queue(&h, op);
        }

        let removed = h.db.transaction(|tx| trim_queue(tx, now)).unwrap();
        assert_eq!(removed, 50);

        let kept: Vec<String> = h
            .db
            .with_conn(pending)
            .unwrap()
            .into_iter()
            .map(|op| op.target_id)
            .collect();
        assert_eq!(kept.len(), MAX_QUEUE_LEN);
        assert_eq!(kept.first().map(String::as_str), Some("i50"));
        assert_eq!(kept.last().map(String::as_str), Some("i249"));
    }

    #[test]
    fn test_trim_drops_entries_older_than_seven_days() {
        let h = Harness::new(true);
        let now = Utc::now();
        queue(
            &h,
            &PendingOperation::at(now - ChronoDuration::days(8), "old", Operation::Delete),
        );
        queue(&h, &PendingOperation::at(now, "fresh", Operation::Delete));

        assert_eq!(h.db.transaction(|tx| trim_queue(tx, now)).unwrap(), 1);
        let left = h.db.with_conn(pending).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].target_id, "fresh");
    }

    #[tokio::test]
    async fn test_trimmed_checkout_drops_its_draft() {
        let h = Harness::new(false);
        h.with_item(item("i1", "Widget", 10));
        let now = Utc::now();
        h.db.with_conn(|conn| {
            db::put(
                conn,
                &MonthHistory {
                    month: now.format("%Y-%m").to_string(),
                    invoices: vec![],
                    fetched_at: now,
                },
            )
        })
        .unwrap();
        let checkout = h.app.checkout();
        checkout
            .add_line(crate::models::CartLine {
                item_id: "i1".into(),
                name: "Widget".into(),
                quantity: 3,
                purchase_price: None,
                sale_price: None,
                mfg_date: None,
                exp_date: None,
            })
            .unwrap();
        let invoice = checkout
            .checkout(crate::checkout::CheckoutRequest {
                kind: TransactionType::Sale,
                invoice_number: "S-9".into(),
                party: None,
            })
            .unwrap();
        queue(&h, &PendingOperation::at(now, "i9", Operation::Delete));

        let removed = h
            .db
            .transaction(|tx| trim_queue(tx, now + ChronoDuration::days(8)))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(h.queued(), 0);
        assert_eq!(
            h.db.with_conn(|conn| db::count(conn, Collection::Invoices)).unwrap(),
            0
        );
        let persisted: MonthHistory = h
            .db
            .with_conn(|conn| db::get(conn, &invoice.month_key()))
            .unwrap()
            .unwrap();
        assert!(persisted.invoices.is_empty());

        h.network.set_online(true);
        let month = h
            .app
            .history()
            .fetch_month(invoice.created_at.year(), invoice.created_at.month())
            .await
            .unwrap();
        assert!(month.is_empty(), "dropped sale must not show in history");
    }

    #[tokio::test]
    async fn test_checkout_job_sends_no_lines_when_header_fails() {
        let h = Harness::new(true);
        h.with_item(item("i1", "Widget", 10));
        queue(&h, &checkout_op("inv1"));
        h.remote.fail(Table::Invoices);

        let report = h.app.processor().run().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(h.queued(), 1);
        assert!(h.remote.rows(Table::History).is_empty());
        assert!(!h.remote.calls().iter().any(|c| c.starts_with("insert:history")));

        h.remote.heal(Table::Invoices);
        let report = h.app.processor().run().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(h.remote.rows(Table::Invoices).len(), 1);
        let lines = h.remote.rows(Table::History);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["invoice_id"], "inv1");
        assert_eq!(h.remote_quantity("i1"), Some(7));
    }

    #[tokio::test]
    async fn test_checkout_job_removes_header_when_lines_fail() {
        let h = Harness::new(true);
        h.with_item(item("i1", "Widget", 10));
        queue(&h, &checkout_op("inv1"));
        h.remote.fail(Table::History);

        let report = h.app.processor().run().await.unwrap();
        assert!(report.failed_job.is_some());
        assert!(h.remote.rows(Table::Invoices).is_empty());
        assert_eq!(h.remote_quantity("i1"), Some(10));
        assert_eq!(h.queued(), 1);

        h.remote.heal(Table::History);
        h.app.processor().run().await.unwrap();
        assert_eq!(h.remote.rows(Table::Invoices).len(), 1);
        assert_eq!(h.remote.rows(Table::History).len(), 1);
        assert_eq!(h.queued(), 0);
    }

    #[tokio::test]
    async fn test_checkout_replay_after_stock_failure_does_not_duplicate() {
        let h = Harness::new(true);
        h.with_item(item("i1", "Widget", 10));
        queue(&h, &checkout_op("inv1"));
        h.remote.fail(Table::Inventory);

        h.app.processor().run().await.unwrap();
        assert_eq!(h.queued(), 1);
        assert_eq!(h.remote.rows(Table::Invoices).len(), 1);

        h.remote.heal(Table::Inventory);
        h.app.processor().run().await.unwrap();
        assert_eq!(h.queued(), 0);
        assert_eq!(h.remote.rows(Table::Invoices).len(), 1);
        assert_eq!(h.remote.rows(Table::History).len(), 1);
        assert_eq!(h.remote_quantity("i1"), Some(7));
    }

    #[tokio::test]
    async fn test_checkout_replay_applies_change_to_current_remote_stock() {
        let h = Harness::new(true);
        h.with_item(item("i1", "Widget", 10));
        queue(&h, &checkout_op("inv1"));
        // Restocked on another device while the sale was queued.
        h.remote
            .update(Table::Inventory, "i1", serde_json::json!({ "quantity": 20 }))
            .await
            .unwrap();

        let report = h.app.processor().run().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(h.remote_quantity("i1"), Some(17));
    }

    #[tokio::test]
    async fn test_checkout_replay_skips_confirmed_stock_changes() {
        let h = Harness::new(true);
        h.with_item(item("i1", "Widget", 10));
        h.with_item(item("i2", "Bolt", 5));
        let mut op = checkout_op("inv1");
        if let Operation::Checkout(job) = &mut op.operation {
            job.stock[0].applied = true;
            job.stock.push(StockChange::new("i2", -2));
        }
        queue(&h, &op);

        h.app.processor().run().await.unwrap();
        assert_eq!(h.queued(), 0);
        assert_eq!(h.remote_quantity("i1"), Some(10));
        assert_eq!(h.remote_quantity("i2"), Some(3));
    }

    #[tokio::test]
    async fn test_failed_checkout_stock_change_stays_pending() {
        let h = Harness::new(true);
        h.with_item(item("i1", "Widget", 10));
        queue(&h, &checkout_op("inv1"));
        h.remote.fail(Table::Inventory);

        h.app.processor().run().await.unwrap();
        let stored = h.db.with_conn(pending).unwrap();
        let Operation::Checkout(job) = &stored[0].operation else {
            panic!("checkout job expected");
        };
        assert!(!job.stock[0].applied);
        assert_eq!(h.remote_quantity("i1"), Some(10));
    }

    #[tokio::test]
    async fn test_concurrent_run_is_skipped() {
        let h = Harness::new(true);
        queue(&h, &PendingOperation::new("i1", Operation::Delete));
        let processor = h.app.processor();

        processor.running.store(true, Ordering::Release);
        let report = processor.run().await.unwrap();
        assert!(report.skipped);
        assert_eq!(h.queued(), 1);

        processor.running.store(false, Ordering::Release);
        let report = processor.run().await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(!processor.is_running(), "guard released after the run");
    }

    #[tokio::test]
    async fn test_queue_status_reports_backlog() {
        let h = Harness::new(false);
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        queue(&h, &PendingOperation::at(at, "i1", Operation::Delete));
        queue(
            &h,
            &PendingOperation::at(at + ChronoDuration::hours(1), "i2", Operation::Delete),
        );

        let status = h.app.processor().queue_status().unwrap();
        assert_eq!(status.pending, 2);
        assert_eq!(status.oldest, Some(at));
        assert!(status.last_sync.is_none());
        assert!(!status.online);
    }

    #[tokio::test]
    async fn test_loop_drains_on_reconnect() {
        let h = Harness::new(false);
        queue(&h, &PendingOperation::new("i1", Operation::Delete));
        let processor = h.app.processor().clone();
        let mut events = processor.subscribe();
        let cancel = CancellationToken::new();

        let handle = start_sync_loop(
            processor,
            h.network.clone(),
            None,
            Duration::from_secs(3600),
            cancel.clone(),
        );
        tokio::task::yield_now().await;
        h.network.set_online(true);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("drain within timeout")
            .unwrap();
        assert_eq!(event, SyncEvent::Drained { processed: 1 });
        assert_eq!(h.queued(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
