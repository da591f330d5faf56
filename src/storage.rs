//! Remote credentials kept in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Environment configuration takes
//! precedence; these entries are the fallback for long-lived installs.

use keyring::Entry;
use tracing::{info, warn};

use crate::error::StorageError;

const SERVICE_NAME: &str = "stockbook";

// Credential keys
pub const KEY_REMOTE_URL: &str = "remote_url";
pub const KEY_API_KEY: &str = "api_key";
pub const KEY_ACCESS_TOKEN: &str = "access_token";
pub const KEY_USER_ID: &str = "user_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_REMOTE_URL, KEY_API_KEY, KEY_ACCESS_TOKEN, KEY_USER_ID];

fn keyring_error(e: keyring::Error) -> StorageError {
    StorageError::Io(std::io::Error::other(e.to_string()))
}

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), StorageError> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    entry.set_password(value).map_err(keyring_error)
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), StorageError> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(keyring_error(e)),
    }
}

/// The remote is usable once a URL and an API key are stored.
pub fn is_configured() -> bool {
    get_credential(KEY_REMOTE_URL).is_some() && get_credential(KEY_API_KEY).is_some()
}

/// Store the remote URL and API key from a connection string (base64 or raw
/// JSON `{ "url": ..., "key": ... }`).
pub fn store_connection_string(raw: &str) -> Result<(), StorageError> {
    let key = crate::api::extract_api_key_from_connection_string(raw);
    let url = crate::api::extract_remote_url_from_connection_string(raw);
    let (Some(key), Some(url)) = (key, url) else {
        return Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "connection string must contain url and key",
        )));
    };
    set_credential(KEY_REMOTE_URL, &url)?;
    set_credential(KEY_API_KEY, &key)?;
    info!(remote_url = %url, "remote credentials updated");
    Ok(())
}

/// Delete every stored credential.
pub fn clear_credentials() -> Result<(), StorageError> {
    info!("deleting all stored remote credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
