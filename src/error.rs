//! Error taxonomy for the cache and sync core.
//!
//! Validation failures (`LimitExceeded`, `InvalidQuantity`,
//! `InsufficientStock`) are raised before any mutation. Remote failures on
//! mutating inventory paths never reach callers: they are absorbed into the
//! pending queue. `QueueJobError` only ever reaches the log. Invoice edits
//! and deletes fail with `SyncPending` while queued work is still waiting.

use crate::models::OperationKind;

/// Local persistence failure. The attempted operation is abandoned and no
/// partial state is written.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("local store lock poisoned")]
    Lock,
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure talking to the remote datastore.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("device is offline")]
    Offline,
    #[error("{0}")]
    Transport(String),
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("remote not configured: {0}")]
    NotConfigured(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("item limit reached ({limit} items on the {tier} plan)")]
    LimitExceeded { limit: usize, tier: String },
    #[error("invalid quantity {quantity} for item {item_id}")]
    InvalidQuantity { item_id: String, quantity: i64 },
    #[error("insufficient stock for item {item_id}: available {available}, requested {requested}")]
    InsufficientStock {
        item_id: String,
        available: i64,
        requested: i64,
    },
    #[error("sync queue still holds {pending} pending operation(s); try again once it drains")]
    SyncPending { pending: usize },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Validation(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(StorageError::Sqlite(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(StorageError::Json(e))
    }
}

impl Error {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// A queued job failed remote replay. The run stops and the job stays queued.
#[derive(Debug, thiserror::Error)]
#[error("queued {kind} job {job_id} failed: {source}")]
pub struct QueueJobError {
    pub job_id: String,
    pub kind: OperationKind,
    #[source]
    pub source: RemoteError,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
