//! Point-to-point link abstraction shared by client and relay

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::liveness::Activity;
use crate::protocol::{ConnectionDescriptor, TransportKind};
use crate::remote::tcp::TcpLink;
use crate::remote::udp::UdpLink;

/// Process-unique link identity; events from superseded links are
/// recognised by it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Inbound traffic and lifecycle of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Data(Bytes),
    Control(Bytes),
    /// Emitted exactly once, whoever closed the link
    Closed,
}

pub type LinkSink = Arc<dyn Fn(LinkId, LinkEvent) + Send + Sync>;

/// Traffic counters of one link
#[derive(Debug, Default)]
pub struct LinkStats {
    pub data_sent: AtomicU64,
    pub data_received: AtomicU64,
    pub control_sent: AtomicU64,
    pub control_received: AtomicU64,
    pub retransmissions: AtomicU64,
}

impl LinkStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reliable-control, best-effort-data channel to one remote peer
pub trait RemoteLink: Send + Sync {
    fn id(&self) -> LinkId;

    fn peer_address(&self) -> SocketAddr;

    fn transport(&self) -> TransportKind;

    /// Connect. Links are single use: a closed link cannot be reopened
    fn open(&self) -> Result<(), LinkError>;

    fn close(&self);

    fn is_open(&self) -> bool;

    /// Best effort, no retry
    fn send_data(&self, payload: &[u8]) -> Result<(), LinkError>;

    /// Delivered exactly once in effect, or the call fails
    fn send_control(&self, payload: &[u8]) -> Result<(), LinkError>;

    fn send_heartbeat(&self) -> Result<(), LinkError>;

    fn activity(&self) -> &Activity;

    fn stats(&self) -> &LinkStats;
}

/// Build an unopened client-side link for `descriptor`
pub fn connect(
    descriptor: &ConnectionDescriptor,
    config: &LinkConfig,
    sink: LinkSink,
) -> Arc<dyn RemoteLink> {
    match descriptor.protocol {
        TransportKind::Tcp => TcpLink::new(descriptor, config.clone(), sink),
        TransportKind::Udp => UdpLink::new(descriptor, config.clone(), sink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_ids_unique() {
        let a = LinkId::next();
        let b = LinkId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_connect_picks_transport() {
        let sink: LinkSink = Arc::new(|_: LinkId, _: LinkEvent| {});
        let config = LinkConfig::default();
        let tcp = connect(
            &ConnectionDescriptor::new(TransportKind::Tcp, "127.0.0.1:1".parse().unwrap()),
            &config,
            sink.clone(),
        );
        let udp = connect(
            &ConnectionDescriptor::new(TransportKind::Udp, "127.0.0.1:1".parse().unwrap()),
            &config,
            sink,
        );
        assert_eq!(tcp.transport(), TransportKind::Tcp);
        assert_eq!(udp.transport(), TransportKind::Udp);
        assert!(!tcp.is_open());
        assert!(!udp.is_open());
        assert!(matches!(udp.send_data(b"x"), Err(LinkError::NotOpen)));
    }
}
