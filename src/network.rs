//! Online/offline signal shared by the history manager and the sync loop.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Cloneable connectivity flag. Every clone observes the same state, and
/// subscribers are woken on each online/offline transition.
#[derive(Clone)]
pub struct NetworkStatus {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current connectivity. Returns `true` when the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Network status changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
