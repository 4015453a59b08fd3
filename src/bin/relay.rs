//! Relay Application
//!
//! Accepts bridge clients over TCP and UDP and fans application payloads
//! out to the other members of each session.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lanbridge::{config::RelayConfig, relay::status, relay::RelayEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN bridge relay");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = RelayConfig::load_or_default(path.as_deref()).context("load relay configuration")?;
    let status_bind = config.status_bind;

    let engine = Arc::new(RelayEngine::start(config).context("start relay")?);
    for (protocol, addr) in engine.local_addrs() {
        println!("Relay listening: {} {}", protocol, addr);
    }

    // Status endpoint runs until shutdown
    let (status_stop_tx, status_stop_rx) = oneshot::channel::<()>();
    let status_task = status_bind.map(|bind| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let shutdown = async {
                let _ = status_stop_rx.await;
            };
            if let Err(e) = status::serve(bind, engine, shutdown).await {
                tracing::error!("Status endpoint on {} failed: {}", bind, e);
            }
        })
    });

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    tracing::info!("Shutting down...");

    let _ = status_stop_tx.send(());
    if let Some(task) = status_task {
        let _ = task.await;
    }

    let stats = engine.stats();
    tokio::task::spawn_blocking(move || engine.shutdown()).await?;
    tracing::info!("Final relay stats: {}", serde_json::to_string(&stats)?);
    Ok(())
}
