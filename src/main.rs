//! Backgammon Server
//!
//! Authoritative server for wagered two-player backgammon.
//! Reads its configuration from the environment and serves WebSocket
//! clients until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use backgammon::{config::ServerConfig, network::GameServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    info!("Backgammon Server v{}", VERSION);
    info!(
        bind = %config.bind_addr,
        escrow = ?config.escrow.mode,
        clock_ms = config.session.time_limit_ms,
        increment_ms = config.session.increment_ms,
        "Configuration loaded"
    );
    if config.auth.skip_verification {
        info!("SKIP_AUTH_VERIFICATION is set; client-claimed addresses are trusted");
    }

    let server = Arc::new(GameServer::new(config).context("failed to build server")?);

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await.context("server stopped with an error")?;
    info!("Server stopped");
    Ok(())
}
