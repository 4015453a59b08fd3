//! Shared protocol definitions
//!
//! Types that appear on the wire or in configuration on both the bridge
//! client and the relay.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// Per-peer manager eligibility/role flag, encoded as one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ManagerStatus {
    CannotManage = 0,
    CanManage = 1,
    IsManager = 2,
}

impl ManagerStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ManagerStatus::CannotManage),
            1 => Some(ManagerStatus::CanManage),
            2 => Some(ManagerStatus::IsManager),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether a peer with this status may hold the manager slot
    pub fn is_eligible(self) -> bool {
        self != ManagerStatus::CannotManage
    }
}

impl fmt::Display for ManagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CannotManage => write!(f, "CannotManage"),
            Self::CanManage => write!(f, "CanManage"),
            Self::IsManager => write!(f, "IsManager"),
        }
    }
}

/// Transport used by a remote link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Where a remote link connects to, and optionally where it binds locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub protocol: TransportKind,
    pub remote_address: SocketAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<SocketAddr>,
}

impl ConnectionDescriptor {
    pub fn new(protocol: TransportKind, remote_address: SocketAddr) -> Self {
        Self {
            protocol,
            remote_address,
            local_address: None,
        }
    }

    pub fn with_local_address(mut self, local_address: SocketAddr) -> Self {
        self.local_address = Some(local_address);
        self
    }
}

/// Multicast group used by a session: `224.1.<hi>.<lo>`.
///
/// Each octet comes from the session id and is clamped to at least 1.
pub fn multicast_group(session_id: i32) -> Ipv4Addr {
    let high = ((session_id >> 8) & 0xFF) as u8;
    let low = (session_id & 0xFF) as u8;
    Ipv4Addr::new(224, 1, high.max(1), low.max(1))
}
