//! Relay-side links
//!
//! Same [`RemoteLink`] contract as the client, but every send is
//! non-blocking: TCP frames go to the connection's writer task, UDP
//! datagrams go straight out of a clone of the listener socket, so any
//! thread may send. A UDP control
//! message gets one acknowledgement deadline and no retransmission; the
//! event loop closes links whose deadline passed.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::LinkError;
use crate::liveness::Activity;
use crate::protocol::TransportKind;
use crate::remote::frame::{encode_frame, Datagram, Frame, MessageKind};
use crate::remote::history::ControlHistory;
use crate::remote::link::{LinkEvent, LinkId, LinkSink, LinkStats, RemoteLink};

/// Accepted TCP connection
pub struct RelayTcpLink {
    id: LinkId,
    peer: SocketAddr,
    output_buffer_size: usize,
    writer: Mutex<Option<UnboundedSender<Bytes>>>,
    open: AtomicBool,
    activity: Activity,
    stats: LinkStats,
    sink: LinkSink,
}

impl RelayTcpLink {
    pub fn new(
        id: LinkId,
        peer: SocketAddr,
        output_buffer_size: usize,
        writer: UnboundedSender<Bytes>,
        sink: LinkSink,
    ) -> Self {
        Self {
            id,
            peer,
            output_buffer_size,
            writer: Mutex::new(Some(writer)),
            open: AtomicBool::new(true),
            activity: Activity::new(),
            stats: LinkStats::default(),
            sink,
        }
    }

    /// One frame decoded by the connection's reader task
    pub fn receive(&self, frame: Frame) {
        self.activity.touch();
        match frame.kind {
            MessageKind::Data => {
                LinkStats::bump(&self.stats.data_received);
                (self.sink)(self.id, LinkEvent::Data(frame.payload));
            }
            MessageKind::Control => {
                LinkStats::bump(&self.stats.control_received);
                (self.sink)(self.id, LinkEvent::Control(frame.payload));
            }
            MessageKind::Heartbeat => {}
        }
    }

    fn enqueue(&self, kind: MessageKind, payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > self.output_buffer_size {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        let writer = self.writer.lock();
        let writer = writer.as_ref().ok_or(LinkError::NotOpen)?;
        writer
            .send(encode_frame(kind, payload))
            .map_err(|_| LinkError::Closed)
    }
}

impl RemoteLink for RelayTcpLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer_address(&self) -> SocketAddr {
        self.peer
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn open(&self) -> Result<(), LinkError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(LinkError::Closed)
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            // Dropping the sender ends the writer task, which shuts the stream
            self.writer.lock().take();
            (self.sink)(self.id, LinkEvent::Closed);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_data(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.enqueue(MessageKind::Data, payload)?;
        LinkStats::bump(&self.stats.data_sent);
        Ok(())
    }

    fn send_control(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.enqueue(MessageKind::Control, payload)?;
        LinkStats::bump(&self.stats.control_sent);
        Ok(())
    }

    fn send_heartbeat(&self) -> Result<(), LinkError> {
        self.enqueue(MessageKind::Heartbeat, &[])
    }

    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

/// UDP peer, keyed by its source address on a listener socket
pub struct RelayUdpLink {
    id: LinkId,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    output_buffer_size: usize,
    ack_timeout: Duration,
    next_packet_id: AtomicU64,
    /// Acknowledgement deadlines by packet id
    pending: Mutex<HashMap<u64, Instant>>,
    history: Mutex<ControlHistory>,
    open: AtomicBool,
    activity: Activity,
    stats: LinkStats,
    sink: LinkSink,
}

impl RelayUdpLink {
    pub fn new(
        id: LinkId,
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        output_buffer_size: usize,
        ack_timeout: Duration,
        sink: LinkSink,
    ) -> Self {
        Self {
            id,
            peer,
            socket,
            output_buffer_size,
            ack_timeout,
            next_packet_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(ControlHistory::default()),
            open: AtomicBool::new(true),
            activity: Activity::new(),
            stats: LinkStats::default(),
            sink,
        }
    }

    /// One datagram from this peer. A malformed datagram is a protocol
    /// violation; the caller closes the link.
    pub fn receive(&self, datagram: &[u8]) -> Result<(), LinkError> {
        self.activity.touch();
        match Datagram::decode(datagram)? {
            Datagram::Data(payload) => {
                LinkStats::bump(&self.stats.data_received);
                (self.sink)(self.id, LinkEvent::Data(payload));
            }
            Datagram::Control { packet_id, payload } => {
                if let Err(e) = self.transmit(&Datagram::Ack(packet_id).encode()) {
                    tracing::debug!("ACK {} to {} not sent: {}", packet_id, self.peer, e);
                }
                if self.history.lock().record(packet_id) {
                    LinkStats::bump(&self.stats.control_received);
                    (self.sink)(self.id, LinkEvent::Control(payload));
                }
            }
            Datagram::Ack(packet_id) => {
                self.pending.lock().remove(&packet_id);
            }
            Datagram::Heartbeat => {}
        }
        Ok(())
    }

    /// Whether any control message is past its acknowledgement deadline
    pub fn ack_expired(&self, now: Instant) -> bool {
        self.pending.lock().values().any(|deadline| *deadline <= now)
    }

    pub fn pending_acks(&self) -> usize {
        self.pending.lock().len()
    }

    fn transmit(&self, datagram: &[u8]) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotOpen);
        }
        self.socket.send_to(datagram, self.peer)?;
        Ok(())
    }

    fn check_size(&self, payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > self.output_buffer_size {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        Ok(())
    }
}

impl RemoteLink for RelayUdpLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer_address(&self) -> SocketAddr {
        self.peer
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn open(&self) -> Result<(), LinkError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(LinkError::Closed)
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.pending.lock().clear();
            (self.sink)(self.id, LinkEvent::Closed);
        }
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

    /// Returns once sent; the acknowledgement is checked by the event loop
    fn send_control(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.check_size(payload)?;
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .insert(packet_id, Instant::now() + self.ack_timeout);
        let datagram = Datagram::Control {
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        };
        self.transmit(&datagram.encode())?;
        LinkStats::bump(&self.stats.control_sent);
        Ok(())
    }

    fn send_heartbeat(&self) -> Result<(), LinkError> {
        self.transmit(&Datagram::Heartbeat.encode())
    }

    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn stats(&self) -> &LinkStats {
        &self.stats
    }
}
