//! Local SQLite store for Stockbook.
//!
//! Uses rusqlite with WAL mode. Every collection is a key/JSON table so the
//! cache managers can upsert whole records atomically, and several writes can
//! share one transaction when an operation must land all-or-nothing.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::StorageError;
use crate::models::{self, Cart, InventoryItem, Invoice, MonthHistory, PendingOperation};

/// Shared handle to the local database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "stockbook.db";

/// Initialize the database at `{data_dir}/stockbook.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, StorageError> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

impl DbState {
    /// Fully migrated in-memory store. Nothing survives the process.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Lock)
    }

    /// Run `f` against the connection outside of an explicit transaction.
    pub fn with_conn<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside one SQLite transaction. Any error rolls back every
    /// write `f` made.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StorageError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(StorageError::from)?;
        Ok(out)
    }
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: one key/JSON table per collection.
fn migrate_v1(conn: &Connection) -> Result<(), StorageError> {
    let mut sql = String::new();
    for collection in Collection::ALL {
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );\n",
            collection.table()
        ));
    }
    sql.push_str("INSERT INTO schema_version (version) VALUES (1);");

    conn.execute_batch(&sql).map_err(|e| {
        error!("Migration v1 failed: {e}");
        StorageError::from(e)
    })?;

    info!("Applied migration v1 (collections)");
    Ok(())
}

/// Migration v2: local settings and queue ordering index.
fn migrate_v2(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_created_at ON sync_queue(created_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        StorageError::from(e)
    })?;

    info!("Applied migration v2 (local_settings, queue index)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Inventory,
    Invoices,
    SyncQueue,
    Cart,
    HistoryCache,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Inventory,
        Collection::Invoices,
        Collection::SyncQueue,
        Collection::Cart,
        Collection::HistoryCache,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Collection::Inventory => "inventory",
            Collection::Invoices => "invoices",
            Collection::SyncQueue => "sync_queue",
            Collection::Cart => "cart",
            Collection::HistoryCache => "history_cache",
        }
    }
}

/// A value stored in one of the local collections.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn key(&self) -> String;

    /// Timestamp written to the `created_at` column, used for ordering.
    fn created_at(&self) -> Option<chrono::DateTime<Utc>> {
        None
    }
}

impl Record for InventoryItem {
    const COLLECTION: Collection = Collection::Inventory;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn created_at(&self) -> Option<chrono::DateTime<Utc>> {
        Some(self.created_at)
    }
}

impl Record for Invoice {
    const COLLECTION: Collection = Collection::Invoices;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn created_at(&self) -> Option<chrono::DateTime<Utc>> {
        Some(self.created_at)
    }
}

impl Record for PendingOperation {
    const COLLECTION: Collection = Collection::SyncQueue;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn created_at(&self) -> Option<chrono::DateTime<Utc>> {
        Some(self.created_at)
    }
}

pub const CART_KEY: &str = "current";

impl Record for Cart {
    const COLLECTION: Collection = Collection::Cart;

    fn key(&self) -> String {
        CART_KEY.to_string()
    }
}

impl Record for MonthHistory {
    const COLLECTION: Collection = Collection::HistoryCache;

    fn key(&self) -> String {
        self.month.clone()
    }

    fn created_at(&self) -> Option<chrono::DateTime<Utc>> {
        Some(self.fetched_at)
    }
}

/// Insert or replace a record by its key.
pub fn put<T: Record>(conn: &Connection, record: &T) -> Result<(), StorageError> {
    let data = serde_json::to_string(record)?;
    let now = models::timestamp(&Utc::now());
    let created_at = record
        .created_at()
        .map(|at| models::timestamp(&at))
        .unwrap_or_else(|| now.clone());
    let sql = format!(
        "INSERT INTO {} (key, data, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
            data = excluded.data,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at",
        T::COLLECTION.table()
    );
    conn.execute(&sql, params![record.key(), data, created_at, now])?;
    Ok(())
}

pub fn get<T: Record>(conn: &Connection, key: &str) -> Result<Option<T>, StorageError> {
    let sql = format!("SELECT data FROM {} WHERE key = ?1", T::COLLECTION.table());
    let raw: Option<String> = conn
        .query_row(&sql, params![key], |row| row.get(0))
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// All records of a collection in insertion order.
pub fn get_all<T: Record>(conn: &Connection) -> Result<Vec<T>, StorageError> {
    let sql = format!("SELECT data FROM {} ORDER BY rowid", T::COLLECTION.table());
    decode_rows(conn, &sql, [])
}

pub(crate) fn decode_rows<T: DeserializeOwned, P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<T>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let raw: Vec<String> = stmt
        .query_map(params, |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    raw.iter()
        .map(|data| serde_json::from_str(data).map_err(StorageError::from))
        .collect()
}

/// Delete one record. Returns whether a row was removed.
pub fn delete(conn: &Connection, collection: Collection, key: &str) -> Result<bool, StorageError> {
    let sql = format!("DELETE FROM {} WHERE key = ?1", collection.table());
    Ok(conn.execute(&sql, params![key])? > 0)
}

/// Delete every record except `key`. Returns the number removed.
pub fn retain_only(
    conn: &Connection,
    collection: Collection,
    key: &str,
) -> Result<usize, StorageError> {
    let sql = format!("DELETE FROM {} WHERE key <> ?1", collection.table());
    Ok(conn.execute(&sql, params![key])?)
}

pub fn clear(conn: &Connection, collection: Collection) -> Result<usize, StorageError> {
    let sql = format!("DELETE FROM {}", collection.table());
    Ok(conn.execute(&sql, [])?)
}

pub fn count(conn: &Connection, collection: Collection) -> Result<usize, StorageError> {
    let sql = format!("SELECT COUNT(*) FROM {}", collection.table());
    let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(n as usize)
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )?;
    Ok(())
}
