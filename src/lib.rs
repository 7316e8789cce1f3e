//! Orchestrates startup and lifecycle for the SMTP sink: loads configuration,
//! opens the configured store, and runs the SMTP listener until a shutdown
//! signal arrives, giving in-flight connections a brief window to drain.

pub mod config;
pub mod smtp;
pub mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use store::{EmailStore, InMemoryEmailStore, SqliteEmailStore};

/// Runs the SMTP sink to completion. Returns once the listener has shut down
/// and every in-flight connection has drained or been cancelled.
pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = config::Config::from_env().context("failed to load configuration")?;
    let store = open_store(&config).await?;

    let server = smtp::Server::new(config, store)?;
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {e:#}");
            return;
        }
        info!("shutdown signal received");
        signal_token.cancel();
    });

    server.run(shutdown).await
}

async fn open_store(config: &config::Config) -> Result<Arc<dyn EmailStore>> {
    match &config.database_path {
        Some(path) => {
            let store = SqliteEmailStore::connect(path)
                .await
                .with_context(|| format!("failed to open SQLite store at {path}"))?;
            Ok(Arc::new(store))
        }
        None => {
            info!("no database_path configured, using an in-memory store");
            Ok(Arc::new(InMemoryEmailStore::new()))
        }
    }
}
