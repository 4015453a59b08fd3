//! Relay engine and its listener event loops
//!
//! Each listener set runs on its own IO thread with a current-thread tokio
//! runtime. Socket tasks only decode and enqueue; one loop per IO thread
//! owns the link table and drains the queue, so links closing themselves
//! from another thread (the liveness supervisor, a failed send) reach the
//! table as queued notifications.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::config::{ListenerConfig, RelayConfig};
use crate::constants::POLL_INTERVAL;
use crate::liveness::LinkSupervisor;
use crate::protocol::TransportKind;
use crate::relay::link::{RelayTcpLink, RelayUdpLink};
use crate::relay::session::{SessionSummary, SessionTable};
use crate::remote::frame::{Frame, FrameDecoder, LENGTH_LEN, PACKET_ID_LEN, TYPE_LEN};
use crate::remote::link::{LinkEvent, LinkId, LinkSink, RemoteLink};
use crate::remote::session::{RemoteSession, SessionEvent};
use crate::Result;

/// Counters reported by the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub listeners: usize,
    pub sessions: usize,
    pub members: usize,
    /// Links currently open
    pub links: usize,
    /// Links accepted since start
    pub links_total: u64,
    pub packets_forwarded: u64,
}

/// State shared by every IO thread of one engine
struct Shared {
    config: RelayConfig,
    table: SessionTable,
    supervisor: Arc<LinkSupervisor>,
    links: AtomicUsize,
    links_total: AtomicU64,
}

/// Session relay: listener sets sharing one session table and one
/// liveness supervisor
pub struct RelayEngine {
    shared: Arc<Shared>,
    io_threads: Mutex<Vec<IoThread>>,
    next_listener: AtomicUsize,
    started_at: DateTime<Utc>,
}

impl RelayEngine {
    /// Bind the configured listeners and start serving
    pub fn start(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let supervisor = LinkSupervisor::start(&config.heartbeat)?;
        let listeners = config.listeners.clone();
        let engine = Self {
            shared: Arc::new(Shared {
                config,
                table: SessionTable::new(),
                supervisor,
                links: AtomicUsize::new(0),
                links_total: AtomicU64::new(0),
            }),
            io_threads: Mutex::new(Vec::new()),
            next_listener: AtomicUsize::new(1),
            started_at: Utc::now(),
        };
        engine.spawn_listener(&listeners)?;
        Ok(engine)
    }

    /// Start one more listener set on its own IO thread. Returns its id.
    pub fn spawn_listener(&self, listeners: &[ListenerConfig]) -> Result<usize> {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let io = IoThread::spawn(id, listeners, self.shared.clone())?;
        for (protocol, addr) in &io.addrs {
            tracing::info!("Relay listener {} accepting {} on {}", id, protocol, addr);
        }
        self.io_threads.lock().push(io);
        Ok(id)
    }

    /// Stop one listener set; its links are dropped from their sessions
    pub fn shutdown_listener(&self, id: usize) -> bool {
        let io = {
            let mut threads = self.io_threads.lock();
            match threads.iter().position(|io| io.id == id) {
                Some(index) => threads.remove(index),
                None => return false,
            }
        };
        io.stop();
        true
    }

    /// Addresses actually bound, across all listener sets
    pub fn local_addrs(&self) -> Vec<(TransportKind, SocketAddr)> {
        self.io_threads
            .lock()
            .iter()
            .flat_map(|io| io.addrs.iter().copied())
            .collect()
    }

    pub fn local_addr(&self, protocol: TransportKind) -> Option<SocketAddr> {
        self.local_addrs()
            .into_iter()
            .find(|(kind, _)| *kind == protocol)
            .map(|(_, addr)| addr)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.shared.table
    }

    pub fn session(&self, session_id: i32) -> Option<SessionSummary> {
        self.shared.table.summary(session_id)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            listeners: self.io_threads.lock().len(),
            sessions: self.shared.table.session_count(),
            members: self.shared.table.member_count(),
            links: self.shared.links.load(Ordering::SeqCst),
            links_total: self.shared.links_total.load(Ordering::SeqCst),
            packets_forwarded: self.shared.table.forwarded(),
        }
    }

    pub fn shutdown(&self) {
        let threads: Vec<_> = self.io_threads.lock().drain(..).collect();
        let running = !threads.is_empty();
        for io in threads {
            io.stop();
        }
        self.shared.supervisor.stop();
        if running {
            tracing::info!("Relay stopped");
        }
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One listener set and the thread running its event loop
struct IoThread {
    id: usize,
    addrs: Vec<(TransportKind, SocketAddr)>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

enum BoundSocket {
    Tcp(std::net::TcpListener),
    Udp(std::net::UdpSocket),
}

impl IoThread {
    fn spawn(id: usize, listeners: &[ListenerConfig], shared: Arc<Shared>) -> Result<Self> {
        // Bound here so failures reach the caller and ephemeral ports are known
        let mut sockets = Vec::with_capacity(listeners.len());
        let mut addrs = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let socket = bind(listener)?;
            let addr = match &socket {
                BoundSocket::Tcp(s) => s.local_addr()?,
                BoundSocket::Udp(s) => s.local_addr()?,
            };
            addrs.push((listener.protocol, addr));
            sockets.push(socket);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = thread::Builder::new()
            .name(format!("relay-io-{id}"))
            .spawn(move || {
                runtime.block_on(async move {
                    match EventLoop::new(id, sockets, shared) {
                        Ok(event_loop) => event_loop.run(stop_rx).await,
                        Err(e) => tracing::error!("Relay listener {} failed to start: {}", id, e),
                    }
                });
            })?;

        Ok(Self {
            id,
            addrs,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        tracing::info!("Relay listener {} stopped", self.id);
    }
}

fn bind(listener: &ListenerConfig) -> std::io::Result<BoundSocket> {
    let domain = Domain::for_address(listener.bind);
    match listener.protocol {
        TransportKind::Tcp => {
            let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            socket.bind(&listener.bind.into())?;
            socket.listen(128)?;
            socket.set_nonblocking(true)?;
            Ok(BoundSocket::Tcp(socket.into()))
        }
        TransportKind::Udp => {
            let socket = std::net::UdpSocket::bind(listener.bind)?;
            socket.set_nonblocking(true)?;
            Ok(BoundSocket::Udp(socket))
        }
    }
}

/// Work handed to the event loop
enum RelayEvent {
    Accepted { stream: TcpStream, peer: SocketAddr },
    Datagram { listener: usize, from: SocketAddr, payload: Bytes },
    TcpFrame { id: LinkId, frame: Frame },
    /// Reader or writer of a TCP connection stopped
    TcpClosed { id: LinkId },
    LinkClosed(LinkId),
    Session { id: LinkId, event: SessionEvent },
}

enum MemberLink {
    Tcp(Arc<RelayTcpLink>),
    Udp(Arc<RelayUdpLink>),
}

impl MemberLink {
    fn as_dyn(&self) -> Arc<dyn RemoteLink> {
        match self {
            MemberLink::Tcp(link) => link.clone(),
            MemberLink::Udp(link) => link.clone(),
        }
    }
}

struct Member {
    link: MemberLink,
    session: Arc<RemoteSession>,
    /// INITIALIZE seen
    initialized: bool,
    joined: Option<i32>,
    /// UDP routing key
    route: Option<(usize, SocketAddr)>,
    reader: Option<task::JoinHandle<()>>,
    writer: Option<task::JoinHandle<()>>,
}

struct EventLoop {
    id: usize,
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    events_rx: mpsc::UnboundedReceiver<RelayEvent>,
    members: HashMap<LinkId, Member>,
    routes: HashMap<(usize, SocketAddr), LinkId>,
    udp_sockets: HashMap<usize, Arc<std::net::UdpSocket>>,
    tasks: Vec<task::JoinHandle<()>>,
}

impl EventLoop {
    /// Must run inside the IO thread's runtime
    fn new(id: usize, sockets: Vec<BoundSocket>, shared: Arc<Shared>) -> std::io::Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut udp_sockets = HashMap::new();
        let mut tasks = Vec::new();
        let datagram_capacity = TYPE_LEN + PACKET_ID_LEN + shared.config.input_buffer_size;

        for (index, socket) in sockets.into_iter().enumerate() {
            match socket {
                BoundSocket::Tcp(listener) => {
                    let listener = TcpListener::from_std(listener)?;
                    tasks.push(tokio::spawn(accept_loop(listener, events_tx.clone())));
                }
                BoundSocket::Udp(socket) => {
                    let sender = Arc::new(socket.try_clone()?);
                    let receiver = UdpSocket::from_std(socket)?;
                    udp_sockets.insert(index, sender);
                    tasks.push(tokio::spawn(receive_loop(
                        index,
                        receiver,
                        datagram_capacity,
                        events_tx.clone(),
                    )));
                }
            }
        }

        Ok(Self {
            id,
            shared,
            events_tx,
            events_rx,
            members: HashMap::new(),
            routes: HashMap::new(),
            udp_sockets,
            tasks,
        })
    }

    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        let mut ack_check = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                Some(event) = self.events_rx.recv() => self.handle(event),
                _ = ack_check.tick() => self.expire_acks(),
            }
        }
        self.close_all().await;
    }

    fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Accepted { stream, peer } => self.accept(stream, peer),
            RelayEvent::Datagram { listener, from, payload } => self.datagram(listener, from, payload),
            RelayEvent::TcpFrame { id, frame } => {
                if let Some(Member { link: MemberLink::Tcp(link), .. }) = self.members.get(&id) {
                    link.receive(frame);
                }
            }
            RelayEvent::TcpClosed { id } => {
                if let Some(member) = self.members.get(&id) {
                    member.link.as_dyn().close();
                }
            }
            RelayEvent::LinkClosed(id) => self.teardown(id),
            RelayEvent::Session { id, event } => self.session_event(id, event),
        }
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay for {} failed: {}", peer, e);
        }
        let id = LinkId::next();
        let (reader, writer) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (session, sink) = self.member_sinks(id);
        let link = Arc::new(RelayTcpLink::new(
            id,
            peer,
            self.shared.config.output_buffer_size,
            frames_tx,
            sink,
        ));

        let reader = tokio::spawn(read_frames(
            id,
            reader,
            self.shared.config.input_buffer_size,
            self.events_tx.clone(),
        ));
        let writer = tokio::spawn(write_frames(id, writer, frames_rx, self.events_tx.clone()));

        tracing::info!("Relay listener {}: TCP link {} from {}", self.id, id, peer);
        self.admit(
            id,
            Member {
                link: MemberLink::Tcp(link),
                session,
                initialized: false,
                joined: None,
                route: None,
                reader: Some(reader),
                writer: Some(writer),
            },
        );
    }

    fn datagram(&mut self, listener: usize, from: SocketAddr, payload: Bytes) {
        let key = (listener, from);
        let id = match self.routes.get(&key) {
            Some(id) => *id,
            None => match self.udp_link(listener, from) {
                Some(id) => id,
                None => return,
            },
        };
        let Some(Member { link: MemberLink::Udp(link), .. }) = self.members.get(&id) else {
            return;
        };
        let link = link.clone();
        if let Err(e) = link.receive(&payload) {
            tracing::warn!("Protocol violation from {}: {}", from, e);
            link.close();
        }
    }

    /// Lazily create the link for a new source address
    fn udp_link(&mut self, listener: usize, from: SocketAddr) -> Option<LinkId> {
        let socket = self.udp_sockets.get(&listener)?.clone();
        let id = LinkId::next();
        let (session, sink) = self.member_sinks(id);
        let link = Arc::new(RelayUdpLink::new(
            id,
            from,
            socket,
            self.shared.config.output_buffer_size,
            self.shared.config.ack_timeout(),
            sink,
        ));
        tracing::info!("Relay listener {}: UDP link {} from {}", self.id, id, from);
        self.routes.insert((listener, from), id);
        self.admit(
            id,
            Member {
                link: MemberLink::Udp(link),
                session,
                initialized: false,
                joined: None,
                route: Some((listener, from)),
                reader: None,
                writer: None,
            },
        );
        Some(id)
    }

    /// Pair a fresh session with the link about to be created. The link's
    /// events feed the session, and its closure is queued for teardown.
    fn member_sinks(&self, id: LinkId) -> (Arc<RemoteSession>, LinkSink) {
        let events = self.events_tx.clone();
        let session = RemoteSession::new(
            0,
            Arc::new(move |event: SessionEvent| {
                let _ = events.send(RelayEvent::Session { id, event });
            }),
        );
        let to_session = session.link_sink();
        let events = self.events_tx.clone();
        let sink: LinkSink = Arc::new(move |id: LinkId, event: LinkEvent| {
            let closed = event == LinkEvent::Closed;
            to_session(id, event);
            if closed {
                let _ = events.send(RelayEvent::LinkClosed(id));
            }
        });
        (session, sink)
    }

    fn admit(&mut self, id: LinkId, member: Member) {
        let link = member.link.as_dyn();
        member.session.set_link(link.clone());
        self.shared.supervisor.register(link);
        self.shared.links.fetch_add(1, Ordering::SeqCst);
        self.shared.links_total.fetch_add(1, Ordering::SeqCst);
        self.members.insert(id, member);
    }

    fn session_event(&mut self, id: LinkId, event: SessionEvent) {
        let Some(member) = self.members.get_mut(&id) else {
            return;
        };
        match event {
            SessionEvent::Initialized { session_id } => {
                member.initialized = true;
                if member.joined == Some(session_id) {
                    return;
                }
                if let Some(previous) = member.joined.take() {
                    self.shared.table.leave(previous, id);
                }
                if session_id > 0 {
                    self.shared.table.join(session_id, id, member.session.clone());
                    member.joined = Some(session_id);
                } else {
                    tracing::warn!("Link {} initialized with session {}; not joined", id, session_id);
                }
            }
            SessionEvent::StatusChanged { enabled } => {
                if !member.initialized {
                    tracing::warn!("Link {} sent ENABLE before INITIALIZE, closing", id);
                    member.link.as_dyn().close();
                    return;
                }
                tracing::debug!("Link {} {}", id, if enabled { "enabled" } else { "disabled" });
            }
            SessionEvent::Packet(payload) => {
                if !member.initialized {
                    tracing::warn!("Link {} sent data before INITIALIZE, closing", id);
                    member.link.as_dyn().close();
                    return;
                }
                match member.joined {
                    Some(session_id) => {
                        self.shared.table.forward(session_id, id, &payload);
                    }
                    None => tracing::trace!("Dropping {} bytes from unjoined link {}", payload.len(), id),
                }
            }
            SessionEvent::ConnectionLost => {
                tracing::debug!("Link {} lost its session", id);
            }
        }
    }

    fn teardown(&mut self, id: LinkId) {
        let Some(mut member) = self.members.remove(&id) else {
            return;
        };
        if let Some(session_id) = member.joined.take() {
            self.shared.table.leave(session_id, id);
        }
        if let Some(route) = member.route.take() {
            self.routes.remove(&route);
        }
        if let Some(reader) = member.reader.take() {
            reader.abort();
        }
        member.session.close();
        self.shared.supervisor.deregister(id);
        self.shared.links.fetch_sub(1, Ordering::SeqCst);
        tracing::info!("Relay listener {}: link {} removed", self.id, id);
    }

    fn expire_acks(&mut self) {
        let now = Instant::now();
        for member in self.members.values() {
            if let MemberLink::Udp(link) = &member.link {
                if link.ack_expired(now) {
                    tracing::warn!("Link {} to {} missed a control acknowledgement, closing", link.id(), link.peer_address());
                    link.close();
                }
            }
        }
    }

    async fn close_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let ids: Vec<LinkId> = self.members.keys().copied().collect();
        let mut writers = Vec::new();
        for id in ids {
            if let Some(writer) = self.members.get_mut(&id).and_then(|m| m.writer.take()) {
                writers.push(writer);
            }
            self.teardown(id);
        }
        // Let queued DROP frames reach the wire
        for writer in writers {
            let _ = tokio::time::timeout(Duration::from_millis(200), writer).await;
        }
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<RelayEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if events.send(RelayEvent::Accepted { stream, peer }).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

async fn receive_loop(
    listener: usize,
    socket: UdpSocket,
    capacity: usize,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    // One spare byte to detect datagrams over capacity
    let mut buf = vec![0u8; capacity + 1];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) if len > capacity => {
                tracing::debug!("Discarding oversized datagram from {}", from);
            }
            Ok((len, from)) => {
                let payload = Bytes::copy_from_slice(&buf[..len]);
                if events.send(RelayEvent::Datagram { listener, from, payload }).is_err() {
                    break;
                }
            }
            Err(e) => tracing::debug!("UDP receive failed: {}", e),
        }
    }
}

async fn read_frames(
    id: LinkId,
    mut reader: OwnedReadHalf,
    max_payload: usize,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let decoder = FrameDecoder::new(max_payload);
    let mut buf = BytesMut::with_capacity(LENGTH_LEN + TYPE_LEN + max_payload);
    'read: loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!("TCP link {}: peer closed the stream", id);
                break;
            }
            Ok(_) => loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        if events.send(RelayEvent::TcpFrame { id, frame }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("TCP link {}: protocol violation: {}", id, e);
                        break 'read;
                    }
                }
            },
            Err(e) => {
                tracing::debug!("TCP link {} read failed: {}", id, e);
                break;
            }
        }
    }
    let _ = events.send(RelayEvent::TcpClosed { id });
}

async fn write_frames(
    id: LinkId,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!("TCP link {} write failed: {}", id, e);
            let _ = events.send(RelayEvent::TcpClosed { id });
            return;
        }
    }
    let _ = writer.shutdown().await;
}
