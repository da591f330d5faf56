//! `stockbook-syncd`: headless sync daemon.
//!
//! ```text
//! stockbook-syncd                          run until Ctrl-C
//! stockbook-syncd login <connection> <user-id>
//! stockbook-syncd logout
//! ```

use anyhow::{bail, Context};
use stockbook_lib::config::AppConfig;
use stockbook_lib::{init_logging, remote, storage, Stockbook};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => run().await,
        Some("login") => {
            let (Some(connection), Some(user_id)) = (args.get(1), args.get(2)) else {
                bail!("usage: stockbook-syncd login <connection-string> <user-id>");
            };
            storage::store_connection_string(connection)
                .context("failed to store remote credentials")?;
            storage::set_credential(storage::KEY_USER_ID, user_id)
                .context("failed to store user id")?;
            println!("Credentials stored in the OS keyring");
            Ok(())
        }
        Some("logout") => {
            storage::clear_credentials().context("failed to clear credentials")?;
            println!("Credentials removed");
            Ok(())
        }
        Some(other) => bail!("unknown command: {other}"),
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    init_logging(&config.log_dir);
    info!("Starting stockbook-syncd v{}", env!("CARGO_PKG_VERSION"));

    let app = Stockbook::open(&config).context("failed to open stockbook")?;

    let online = app.remote().health().await.is_ok();
    app.network().set_online(online);
    if online {
        match remote::enforce_device_limit(app.remote().as_ref(), app.user_id()).await {
            Ok(outcome) if outcome.enforced => warn!(
                evicted = outcome.evicted_devices.len(),
                "Device limit enforced; older devices were signed out"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Device limit check failed"),
        }
        if let Err(e) = app.inventory().load_all().await {
            warn!(error = %e, "Initial inventory load failed");
        }
    } else {
        info!("Remote unreachable at startup; serving from local cache");
    }

    let status = app.processor().queue_status()?;
    info!(
        pending = status.pending,
        items = app.inventory().cached().len(),
        "Local cache ready"
    );

    let background = app.start_background(config.sync_interval, true);
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    background.shutdown().await;
    Ok(())
}
