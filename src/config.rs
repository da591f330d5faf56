//! Process configuration.
//!
//! Values come from `STOCKBOOK_*` environment variables. Remote credentials
//! and the user id fall back to the OS keyring (see `storage`) so a
//! long-lived install does not need secrets in its environment.

use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::{api, diagnostics, storage};

pub const ENV_DATA_DIR: &str = "STOCKBOOK_DATA_DIR";
pub const ENV_REMOTE_URL: &str = "STOCKBOOK_REMOTE_URL";
pub const ENV_API_KEY: &str = "STOCKBOOK_API_KEY";
pub const ENV_ACCESS_TOKEN: &str = "STOCKBOOK_ACCESS_TOKEN";
pub const ENV_CONNECTION: &str = "STOCKBOOK_CONNECTION";
pub const ENV_USER_ID: &str = "STOCKBOOK_USER_ID";
pub const ENV_SYNC_INTERVAL: &str = "STOCKBOOK_SYNC_INTERVAL_SECS";
pub const ENV_LOG_DIR: &str = "STOCKBOOK_LOG_DIR";

pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(&'static str),
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

pub struct AppConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub remote_url: String,
    pub api_key: Zeroizing<String>,
    pub access_token: Option<Zeroizing<String>>,
    pub user_id: String,
    pub sync_interval: Duration,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("data_dir", &self.data_dir)
            .field("log_dir", &self.log_dir)
            .field("remote_url", &self.remote_url)
            .field("api_key", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("sync_interval", &self.sync_interval)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), storage::get_credential)
    }

    /// Build the configuration from an environment lookup and a credential
    /// lookup. The credential lookup is only consulted for values the
    /// environment does not provide.
    pub fn from_lookup(
        env: impl Fn(&str) -> Option<String>,
        credential: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let get = |name: &str| non_empty(env(name));
        let connection = get(ENV_CONNECTION);

        let remote_url = get(ENV_REMOTE_URL)
            .or_else(|| {
                connection
                    .as_deref()
                    .and_then(api::extract_remote_url_from_connection_string)
            })
            .or_else(|| non_empty(credential(storage::KEY_REMOTE_URL)))
            .map(|url| api::normalize_remote_url(&url))
            .ok_or(ConfigError::Missing("remote url"))?;

        let api_key = get(ENV_API_KEY)
            .or_else(|| {
                connection
                    .as_deref()
                    .and_then(api::extract_api_key_from_connection_string)
            })
            .or_else(|| non_empty(credential(storage::KEY_API_KEY)))
            .map(Zeroizing::new)
            .ok_or(ConfigError::Missing("api key"))?;

        let access_token = get(ENV_ACCESS_TOKEN)
            .or_else(|| non_empty(credential(storage::KEY_ACCESS_TOKEN)))
            .map(Zeroizing::new);

        let user_id = get(ENV_USER_ID)
            .or_else(|| non_empty(credential(storage::KEY_USER_ID)))
            .ok_or(ConfigError::Missing("user id"))?;

        let sync_interval = match get(ENV_SYNC_INTERVAL) {
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|e| ConfigError::Invalid {
                    var: ENV_SYNC_INTERVAL,
                    reason: format!("{e}"),
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        var: ENV_SYNC_INTERVAL,
                        reason: "must be at least 1".into(),
                    });
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
        };

        let data_dir = get(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(diagnostics::default_data_dir);
        let log_dir = get(ENV_LOG_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));

        Ok(Self {
            data_dir,
            log_dir,
            remote_url,
            api_key,
            access_token,
            user_id,
            sync_interval,
        })
    }
}
