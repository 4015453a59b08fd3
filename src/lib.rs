//! # LAN Bridge
//!
//! Session traffic over LAN multicast, bridged across the WAN by one elected
//! manager per subgroup.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── LAN A ─────────────────────────────┐
//! │  ┌──────────┐     ┌──────────┐     ┌──────────┐                  │
//! │  │ Host A1  │     │ Host A2  │     │ Host A3  │                  │
//! │  │ (member) │     │(manager) │     │ (member) │                  │
//! │  └────┬─────┘     └────┬─────┘     └────┬─────┘                  │
//! │       │                │                │                        │
//! │  ═════╧════════════════╧════════════════╧═════  224.1.x.y:5555   │
//! │        local::channel / local::membership (election)             │
//! └────────────────────────┬───────────────────────────────────────┘
//!                          │ remote::session over remote::{tcp,udp}
//!                          ▼
//!               ┌──────────────────────┐
//!               │   Relay (relay::*)   │   fan-out per session id
//!               └──────────┬───────────┘
//!                          │
//! ┌────────────────────────┴──────────── LAN B ────────────────────┐
//! │                 manager of LAN B ⇄ multicast subgroup            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Application code talks to [`client::BridgeClient`], which decides per
//! packet whether it goes to the multicast subgroup, the remote link, or both.

pub mod client;
pub mod config;
pub mod error;
pub mod liveness;
pub mod local;
pub mod protocol;
pub mod relay;
pub mod remote;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// UDP port of the multicast subgroup protocol
    pub const MULTICAST_PORT: u16 = 5555;

    /// Default application payload buffer size in bytes
    pub const DEFAULT_BUFFER_SIZE: usize = 1024;

    /// Default interval between heartbeats
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

    /// Default inactivity window checked by the liveness sweep
    pub const DEFAULT_INACTIVITY_WINDOW: Duration = Duration::from_secs(30);

    /// How long a joining host waits for an existing manager
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Back-off before re-running the join protocol after an I/O failure
    pub const REJOIN_DELAY: Duration = Duration::from_secs(5);

    /// Client-side wait for a control message acknowledgement
    pub const CONTROL_ACK_TIMEOUT: Duration = Duration::from_secs(3);

    /// Client-side transmissions of one control message
    pub const CONTROL_ATTEMPTS: u32 = 3;

    /// Relay-side single acknowledgement timer
    pub const RELAY_ACK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Control message ids remembered for duplicate suppression
    pub const CONTROL_HISTORY: usize = 30;

    /// Wait for a new manager before re-enabling the remote link
    pub const MANAGER_GRACE: Duration = Duration::from_secs(3);

    /// Delay between remote reconnection attempts
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

    /// TCP connect timeout for remote links
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default relay listening port (TCP and UDP)
    pub const DEFAULT_RELAY_PORT: u16 = 3333;

    /// Receive timeout used by blocking reader threads to notice closure
    pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
}
