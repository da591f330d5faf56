//! Stockbook - offline-first inventory and invoicing core
//!
//! Keeps a local SQLite cache of the user's inventory and invoice history,
//! lets checkouts and inventory edits proceed while offline, and replays the
//! queued work against the remote datastore once connectivity returns.
//!
//! [`Stockbook`] wires the components together once per process; embedders
//! (the `stockbook-syncd` daemon, a UI shell) hold one instance and reach the
//! managers through its accessors.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod checkout;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod history;
pub mod inventory;
pub mod models;
pub mod network;
pub mod profile;
pub mod remote;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

use checkout::CheckoutService;
use config::AppConfig;
use db::DbState;
use error::Error;
use history::HistoryManager;
use inventory::InventoryManager;
use network::NetworkStatus;
use remote::RemoteStore;
use sync::{SyncEvent, SyncProcessor};

/// Initialize structured logging (console + daily rolling file in `log_dir`).
///
/// The appender guard is leaked so buffered lines are flushed for the whole
/// process lifetime.
pub fn init_logging(log_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stockbook_lib=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    std::mem::forget(guard);
}

pub struct Stockbook {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    network: NetworkStatus,
    processor: Arc<SyncProcessor>,
    inventory: Arc<InventoryManager>,
    history: Arc<HistoryManager>,
    checkout: CheckoutService,
    user_id: String,
}

impl Stockbook {
    /// Wire the managers around an already opened store and remote.
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteStore>,
        network: NetworkStatus,
        user_id: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        let processor = Arc::new(SyncProcessor::new(
            db.clone(),
            remote.clone(),
            network.clone(),
        ));
        let inventory = Arc::new(InventoryManager::new(
            db.clone(),
            remote.clone(),
            network.clone(),
            processor.clone(),
            user_id.clone(),
        ));
        let history = Arc::new(HistoryManager::new(
            db.clone(),
            remote.clone(),
            network.clone(),
            inventory.clone(),
            processor.clone(),
            user_id.clone(),
        ));
        let checkout = CheckoutService::new(
            db.clone(),
            network.clone(),
            inventory.clone(),
            history.clone(),
            processor.clone(),
            user_id.clone(),
        );
        Self {
            db,
            remote,
            network,
            processor,
            inventory,
            history,
            checkout,
            user_id,
        }
    }

    /// Open the local store under `config.data_dir` and connect the HTTP
    /// remote. Starts offline; the first probe of the sync loop (or an
    /// embedder calling `network().set_online`) flips it.
    pub fn open(config: &AppConfig) -> Result<Self, Error> {
        let db = Arc::new(db::init(&config.data_dir)?);
        let remote = api::RestRemote::new(
            &config.remote_url,
            config.api_key.as_str(),
            config.access_token.as_deref().map(String::as_str),
        )?;
        info!(
            user_id = %config.user_id,
            remote = %remote.base_url(),
            "Stockbook opened"
        );
        let app = Self::new(db, Arc::new(remote), NetworkStatus::new(false), &config.user_id);
        app.inventory.load_cached()?;
        Ok(app)
    }

    pub fn inventory(&self) -> &InventoryManager {
        &self.inventory
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn checkout(&self) -> &CheckoutService {
        &self.checkout
    }

    pub fn processor(&self) -> &Arc<SyncProcessor> {
        &self.processor
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Spawn the sync loop plus a listener that reloads inventory after each
    /// drain so local stock converges with the server. With `probe` the loop
    /// checks the remote health endpoint on every tick.
    pub fn start_background(&self, interval: Duration, probe: bool) -> BackgroundSync {
        let cancel = CancellationToken::new();
        let sync_loop = sync::start_sync_loop(
            self.processor.clone(),
            self.network.clone(),
            probe.then(|| self.remote.clone()),
            interval,
            cancel.clone(),
        );

        let mut events = self.processor.subscribe();
        let inventory = self.inventory.clone();
        let listener_cancel = cancel.clone();
        let listener = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = listener_cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(SyncEvent::Drained { processed }) => {
                        if let Err(e) = inventory.load_all().await {
                            warn!(processed, error = %e, "Inventory reload after drain failed");
                        }
                    }
                    Ok(SyncEvent::Stopped { job_id, error }) => {
                        warn!(job_id = %job_id, error = %error, "Sync stopped on failing job");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sync event listener lagged; reloading inventory");
                        if let Err(e) = inventory.load_all().await {
                            warn!(error = %e, "Inventory reload failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        BackgroundSync {
            cancel,
            tasks: vec![sync_loop, listener],
        }
    }
}

/// Handle to the tasks spawned by [`Stockbook::start_background`].
pub struct BackgroundSync {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundSync {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Background sync stopped");
    }
}
