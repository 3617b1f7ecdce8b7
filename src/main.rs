//! ironbridge - bouncer-style Matrix to IRC appservice bridge.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ironbridge::config::{Config, Store};
use ironbridge::context::BridgeContext;
use ironbridge::identd;
use ironbridge::matrix::appservice;
use ironbridge::matrix::client::HttpMatrixClient;
use ironbridge::matrix::MatrixApi;
use ironbridge::session::{self, SessionCommand};

/// How long shutdown waits for sessions to QUIT cleanly.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ironbridge.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(
        homeserver = %config.homeserver,
        server_name = %config.server_name,
        listen = %config.listen,
        "Starting ironbridge"
    );

    let store = Store::load(&config.store_path).map_err(|e| {
        error!(path = %config.store_path.display(), error = %e, "Failed to load store");
        e
    })?;

    let matrix: Arc<dyn MatrixApi> = Arc::new(HttpMatrixClient::new(
        &config.homeserver,
        &config.as_token,
    ));

    // claim the bot user before anything tries to act as it
    matrix.ensure_registered(&config.sender_localpart).await?;

    let ctx = BridgeContext::new(config, store, matrix);

    if let Some(port) = ctx.config.identd_port {
        let table = ctx.identd.clone();
        tokio::spawn(identd::run(table, port));
    }

    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            appservice::run(ctx).await;
        });
    }

    // bring persisted networks back up
    let mut activated = 0usize;
    for (user, network) in ctx.store.all_networks() {
        let autoconnect = ctx
            .store
            .network(&user, &network)
            .is_some_and(|n| n.autoconnect);
        if !autoconnect {
            continue;
        }
        match session::activate(&ctx, &user, &network) {
            Ok(()) => activated += 1,
            Err(e) => warn!(%user, %network, error = %e, "not activating network"),
        }
    }
    info!(count = activated, "activated persisted sessions");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let live = ctx.registry.all_sessions();
    for (_, tx) in &live {
        let _ = tx.send(SessionCommand::Shutdown).await;
    }
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while !ctx.registry.all_sessions().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Goodbye");
    Ok(())
}
