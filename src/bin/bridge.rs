//! Bridge Application
//!
//! Joins the multicast subgroup of a session and bridges it to the relay.
//! Lines read from stdin are sent as text messages; text messages from
//! other members are printed.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lanbridge::{
    client::{BridgeClient, ChannelDemux},
    config::BridgeConfig,
};

/// Channel tag of plain text messages
const TEXT_CHANNEL: u8 = 0;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN bridge client");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load_or_default(path.as_deref()).context("load bridge configuration")?;

    let demux = Arc::new(ChannelDemux::new());
    demux.register(
        TEXT_CHANNEL,
        Arc::new(|payload: Bytes| {
            println!("< {}", String::from_utf8_lossy(&payload));
        }),
    );

    let handler = {
        let demux = demux.clone();
        Arc::new(move |payload: Bytes| {
            demux.dispatch(payload);
        })
    };
    let mut client = BridgeClient::start(config, handler).context("start bridge client")?;
    println!(
        "Session {}: type a line to send it, /peers to list the subgroup, Ctrl-D to quit",
        client.session_id()
    );

    for line in std::io::stdin().lock().lines() {
        let line = line.context("read stdin")?;
        match line.trim() {
            "" => continue,
            "/peers" => {
                for peer in client.peers() {
                    println!("  {} {} {:?}{}", peer.address, peer.status, peer.kind, if peer.active { "" } else { " (silent)" });
                }
                println!(
                    "  manager: {}, remote open: {}",
                    client
                        .current_manager()
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|| "none".into()),
                    client.is_remote_open()
                );
            }
            text => {
                if let Err(e) = client.send(&ChannelDemux::tag(TEXT_CHANNEL, text.as_bytes())) {
                    tracing::warn!("Send failed: {}", e);
                }
            }
        }
    }

    client.shutdown();
    if demux.unrouted() > 0 {
        tracing::info!("{} payloads had no registered channel", demux.unrouted());
    }
    Ok(())
}
