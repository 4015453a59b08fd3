//! Client-side UDP link
//!
//! Data and heartbeats are fire and forget. Control messages carry a
//! packet id and are retransmitted until acknowledged; the receiver ACKs
//! every copy but delivers each id once.

use bytes::Bytes;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crate::config::LinkConfig;
use crate::constants::POLL_INTERVAL;
use crate::error::LinkError;
use crate::liveness::Activity;
use crate::protocol::{ConnectionDescriptor, TransportKind};
use crate::remote::frame::{Datagram, PACKET_ID_LEN, TYPE_LEN};
use crate::remote::history::ControlHistory;
use crate::remote::link::{LinkEvent, LinkId, LinkSink, LinkStats, RemoteLink};

pub struct UdpLink {
    me: Weak<Self>,
    id: LinkId,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    config: LinkConfig,
    /// Sending half; the lock serializes sends
    socket: Mutex<Option<UdpSocket>>,
    next_packet_id: AtomicU64,
    /// Senders blocked on an acknowledgement, by packet id
    pending: Mutex<HashMap<u64, Sender<()>>>,
    history: Mutex<ControlHistory>,
    open: AtomicBool,
    closed: AtomicBool,
    activity: Activity,
    stats: LinkStats,
    sink: LinkSink,
}

impl UdpLink {
    pub fn new(descriptor: &ConnectionDescriptor, config: LinkConfig, sink: LinkSink) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: LinkId::next(),
            remote: descriptor.remote_address,
            local: descriptor.local_address,
            config,
            socket: Mutex::new(None),
            next_packet_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(ControlHistory::default()),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            activity: Activity::new(),
            stats: LinkStats::default(),
            sink,
        })
    }

    fn bind_address(&self) -> SocketAddr {
        self.local.unwrap_or_else(|| match self.remote {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        })
    }

    fn transmit(&self, datagram: &[u8]) -> Result<(), LinkError> {
        let result = {
            let socket = self.socket.lock();
            let socket = socket.as_ref().ok_or(LinkError::NotOpen)?;
            socket.send_to(datagram, self.remote)
        };
        result.map(|_| ()).map_err(|e| {
            tracing::warn!("UDP link {} to {} send failed: {}", self.id, self.remote, e);
            LinkError::from(e)
        })
    }

    fn check_size(&self, payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > self.config.output_buffer_size {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        if !self.is_open() {
            return Err(LinkError::NotOpen);
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.socket.lock().take();
        // Dropping the senders fails every blocked control send fast
        self.pending.lock().clear();
        tracing::debug!("UDP link {} to {} closed", self.id, self.remote);
        (self.sink)(self.id, LinkEvent::Closed);
    }

    fn receive_loop(&self, socket: UdpSocket) {
        let capacity = TYPE_LEN + PACKET_ID_LEN + self.config.input_buffer_size;
        // One spare byte to detect datagrams over capacity
        let mut buf = vec![0u8; capacity + 1];
        while self.is_open() {
            let len = match socket.recv_from(&mut buf) {
                Ok((len, from)) if len > capacity => {
                    tracing::debug!("UDP link {}: discarding oversized datagram from {}", self.id, from);
                    continue;
                }
                Ok((len, _from)) => len,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.is_open() {
                        tracing::warn!("UDP link {} receive failed: {}", self.id, e);
                    }
                    break;
                }
            };
            self.activity.touch();
            match Datagram::decode(&buf[..len]) {
                Ok(datagram) => self.handle(datagram),
                Err(e) => {
                    tracing::warn!("UDP link {}: protocol violation: {}", self.id, e);
                    break;
                }
            }
        }
        self.shutdown();
    }

    fn handle(&self, datagram: Datagram) {
        match datagram {
            Datagram::Data(payload) => {
                LinkStats::bump(&self.stats.data_received);
                (self.sink)(self.id, LinkEvent::Data(payload));
            }
            Datagram::Control { packet_id, payload } => self.handle_control(packet_id, payload),
            Datagram::Ack(packet_id) => {
                if let Some(waiter) = self.pending.lock().remove(&packet_id) {
                    let _ = waiter.try_send(());
                }
            }
            Datagram::Heartbeat => {}
        }
    }

    fn handle_control(&self, packet_id: u64, payload: Bytes) {
        // Every copy is acknowledged; the first ACK may have been lost
        if let Err(e) = self.transmit(&Datagram::Ack(packet_id).encode()) {
            tracing::debug!("ACK {} not sent: {}", packet_id, e);
        }
        if self.history.lock().record(packet_id) {
            LinkStats::bump(&self.stats.control_received);
            (self.sink)(self.id, LinkEvent::Control(payload));
        } else {
            tracing::trace!("UDP link {}: duplicate control {}", self.id, packet_id);
        }
    }
}

impl RemoteLink for UdpLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer_address(&self) -> SocketAddr {
        self.remote
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn open(&self) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        if self.is_open() {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.bind_address())?;
        let reader = socket.try_clone()?;
        reader.set_read_timeout(Some(POLL_INTERVAL))?;
        *self.socket.lock() = Some(socket);
        self.open.store(true, Ordering::SeqCst);
        self.activity.touch();

        let link = self.me.upgrade().ok_or(LinkError::Closed)?;
        let spawned = thread::Builder::new()
            .name(format!("udp-link-{}", self.id.as_u64()))
            .spawn(move || link.receive_loop(reader));
        if let Err(e) = spawned {
            self.shutdown();
            return Err(e.into());
        }

        tracing::info!("UDP link {} open towards {}", self.id, self.remote);
        Ok(())
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_data(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.check_size(payload)?;
        self.transmit(&Datagram::Data(Bytes::copy_from_slice(payload)).encode())?;
        LinkStats::bump(&self.stats.data_sent);
        Ok(())
    }

    /// Blocks for up to `control_attempts * ack_timeout`. Exhausting the
    /// attempts closes the link.
    fn send_control(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.check_size(payload)?;
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = bounded(1);
        self.pending.lock().insert(packet_id, tx);

        let datagram = Datagram::Control {
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }
        .encode();

        let attempts = self.config.control_attempts;
        for attempt in 1..=attempts {
            if attempt > 1 {
                LinkStats::bump(&self.stats.retransmissions);
                tracing::debug!("UDP link {}: retransmitting control {} ({}/{})", self.id, packet_id, attempt, attempts);
            }
            if let Err(e) = self.transmit(&datagram) {
                self.pending.lock().remove(&packet_id);
                return Err(e);
            }
            match rx.recv_timeout(self.config.ack_timeout()) {
                Ok(()) => {
                    LinkStats::bump(&self.stats.control_sent);
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(LinkError::Closed),
            }
        }

        self.pending.lock().remove(&packet_id);
        tracing::warn!(
            "UDP link {} to {}: control {} unacknowledged after {} attempts",
            self.id,
            self.remote,
            packet_id,
            attempts
        );
        self.shutdown();
        Err(LinkError::AckTimeout { attempts })
    }

    fn send_heartbeat(&self) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotOpen);
        }
        self.transmit(&Datagram::Heartbeat.encode())
    }

    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::{Duration, Instant};

    fn open_link(config: LinkConfig) -> (Arc<UdpLink>, UdpSocket, Receiver<LinkEvent>) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let (tx, rx) = unbounded();
        let sink: LinkSink = Arc::new(move |_: LinkId, event: LinkEvent| {
            let _ = tx.send(event);
        });
        let descriptor = ConnectionDescriptor::new(TransportKind::Udp, peer.local_addr().unwrap())
            .with_local_address("127.0.0.1:0".parse().unwrap());
        let link = UdpLink::new(&descriptor, config, sink);
        link.open().unwrap();
        (link, peer, rx)
    }

    /// Address the link's socket is bound to, learned from a heartbeat
    fn link_address(link: &UdpLink, peer: &UdpSocket) -> SocketAddr {
        link.send_heartbeat().unwrap();
        let mut buf = [0u8; 16];
        let (_, from) = peer.recv_from(&mut buf).unwrap();
        from
    }

    #[test]
    fn test_duplicate_control_delivered_once_acked_each_time() {
        let (link, peer, rx) = open_link(LinkConfig::default());
        let link_addr = link_address(&link, &peer);

        let ctrl = Datagram::Control {
            packet_id: 11,
            payload: Bytes::from_static(&[0, 4, 1]),
        }
        .encode();
        for _ in 0..3 {
            peer.send_to(&ctrl, link_addr).unwrap();
        }

        let mut buf = [0u8; 64];
        for _ in 0..3 {
            let (len, _) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(Datagram::decode(&buf[..len]).unwrap(), Datagram::Ack(11));
        }

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            LinkEvent::Control(Bytes::from_static(&[0, 4, 1]))
        );
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        link.close();
    }

    #[test]
    fn test_control_acknowledged() {
        let (link, peer, _rx) = open_link(LinkConfig::default());
        let responder = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (len, from) = peer.recv_from(&mut buf).unwrap();
            match Datagram::decode(&buf[..len]).unwrap() {
                Datagram::Control { packet_id, .. } => {
                    peer.send_to(&Datagram::Ack(packet_id).encode(), from).unwrap();
                }
                other => panic!("unexpected {other:?}"),
            }
        });
        link.send_control(&[0, 2]).unwrap();
        responder.join().unwrap();
        assert!(link.is_open());
    }

    #[test]
    fn test_unacknowledged_control_gives_up_after_attempts() {
        let config = LinkConfig {
            ack_timeout_ms: 100,
            control_attempts: 3,
            ..Default::default()
        };
        let (link, peer, rx) = open_link(config);

        let started = Instant::now();
        let result = link.send_control(&[0, 2]);
        let elapsed = started.elapsed();
        assert!(matches!(result, Err(LinkError::AckTimeout { attempts: 3 })));
        assert!(elapsed >= Duration::from_millis(300), "gave up after {elapsed:?}");
        assert!(!link.is_open());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), LinkEvent::Closed);

        // Exactly three copies went out, all with the same packet id
        peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 64];
        let mut ids = Vec::new();
        while let Ok((len, _)) = peer.recv_from(&mut buf) {
            if let Ok(Datagram::Control { packet_id, .. }) = Datagram::decode(&buf[..len]) {
                ids.push(packet_id);
            }
        }
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn test_oversized_datagram_discarded() {
        let config = LinkConfig {
            input_buffer_size: 16,
            ..Default::default()
        };
        let (link, peer, rx) = open_link(config);
        let link_addr = link_address(&link, &peer);

        peer.send_to(&Datagram::Data(Bytes::from(vec![7u8; 40])).encode(), link_addr).unwrap();
        let fits = Bytes::from(vec![1u8; 16]);
        peer.send_to(&Datagram::Data(fits.clone()).encode(), link_addr).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), LinkEvent::Data(fits));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(link.is_open());
        link.close();
    }

    #[test]
    fn test_close_releases_blocked_sender() {
        let config = LinkConfig {
            ack_timeout_ms: 5_000,
            ..Default::default()
        };
        let (link, _peer, _rx) = open_link(config);
        let closer = {
            let link = link.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                link.close();
            })
        };
        let started = Instant::now();
        assert!(matches!(link.send_control(&[0, 2]), Err(LinkError::Closed)));
        assert!(started.elapsed() < Duration::from_secs(2));
        closer.join().unwrap();
    }
}
