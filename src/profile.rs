//! Subscription tier lookup for the item limit.
//!
//! The tier comes from the owner's row in `profiles`. The last value seen is
//! cached in `local_settings` so limits still apply offline.

use serde_json::Value;
use tracing::{debug, warn};

use crate::db::{self, DbState};
use crate::network::NetworkStatus;
use crate::remote::{Query, RemoteStore, Table};

pub const FREE_ITEM_LIMIT: usize = 20;
pub const PREMIUM_ITEM_LIMIT: usize = 1500;

const SETTINGS_CATEGORY: &str = "profile";
const SETTINGS_TIER_KEY: &str = "tier";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn item_limit(self) -> usize {
        match self {
            Tier::Free => FREE_ITEM_LIMIT,
            Tier::Premium => PREMIUM_ITEM_LIMIT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "premium" | "pro" => Some(Tier::Premium),
            _ => None,
        }
    }

    /// Read the tier from a `profiles` row.
    fn from_profile(row: &Value) -> Tier {
        if let Some(tier) = row
            .get("subscription_tier")
            .or_else(|| row.get("plan"))
            .and_then(Value::as_str)
            .and_then(Tier::parse)
        {
            return tier;
        }
        match row.get("is_premium").and_then(Value::as_bool) {
            Some(true) => Tier::Premium,
            _ => Tier::Free,
        }
    }
}

fn cached_tier(db: &DbState) -> Option<Tier> {
    db.with_conn(|conn| {
        Ok::<_, crate::error::StorageError>(db::get_setting(
            conn,
            SETTINGS_CATEGORY,
            SETTINGS_TIER_KEY,
        ))
    })
    .ok()
    .flatten()
    .and_then(|raw| Tier::parse(&raw))
}

/// Current tier of `user_id`: remote when reachable, else the cached value,
/// else free.
pub async fn current_tier(
    db: &DbState,
    remote: &dyn RemoteStore,
    network: &NetworkStatus,
    user_id: &str,
) -> Tier {
    if network.is_online() {
        let query = Query::new().eq("id", user_id);
        match remote.select(Table::Profiles, &query).await {
            Ok(rows) => {
                let Some(row) = rows.first() else {
                    // No profile row: forget any tier cached for a previous
                    // account so offline limits fall back to free.
                    let cleared = db.with_conn(|conn| {
                        db::delete_setting(conn, SETTINGS_CATEGORY, SETTINGS_TIER_KEY)
                    });
                    if let Err(e) = cleared {
                        warn!(error = %e, "Failed to clear cached subscription tier");
                    }
                    debug!(user_id, "No profile found; using free tier");
                    return Tier::Free;
                };
                let tier = Tier::from_profile(row);
                let stored = db.with_conn(|conn| {
                    db::set_setting(conn, SETTINGS_CATEGORY, SETTINGS_TIER_KEY, tier.as_str())
                });
                if let Err(e) = stored {
                    warn!(error = %e, "Failed to cache subscription tier");
                }
                debug!(tier = tier.as_str(), "Subscription tier resolved from remote");
                return tier;
            }
            Err(e) => warn!(error = %e, "Profile lookup failed, using cached tier"),
        }
    }
    cached_tier(db).unwrap_or(Tier::Free)
}
