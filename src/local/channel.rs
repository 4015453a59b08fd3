//! Multicast socket for one subgroup
//!
//! Joins the session's group on the fixed multicast port and runs a single
//! receive thread that parses datagrams and hands them to the owner as
//! [`ChannelEvent`]s.

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::MembershipConfig;
use crate::constants::POLL_INTERVAL;
use crate::error::MembershipError;
use crate::local::wire::{LocalMessage, HEADER_LEN};
use crate::protocol::{multicast_group, ManagerStatus};

/// Parsed inbound traffic, tagged with the sender's address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    JoinRequest { from: IpAddr, status: ManagerStatus },
    JoinResponse { from: IpAddr, status: ManagerStatus },
    Drop { from: IpAddr },
    Heartbeat { from: IpAddr, status: ManagerStatus },
    App { from: IpAddr, payload: Bytes },
    /// Receive loop ended; `by_owner` is false for socket failures
    Closed { by_owner: bool },
}

pub type ChannelSink = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Counters for one channel
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub datagrams_received: AtomicU64,
    pub datagrams_discarded: AtomicU64,
    pub datagrams_sent: AtomicU64,
}

pub struct MulticastChannel {
    socket: UdpSocket,
    group: Ipv4Addr,
    port: u16,
    interface: Option<Ipv4Addr>,
    session_id: i32,
    local_address: IpAddr,
    output_buffer_size: usize,
    running: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ChannelStats>,
}

impl MulticastChannel {
    /// Bind the session's group and start the receive thread
    pub fn open(
        session_id: i32,
        config: &MembershipConfig,
        local_address: IpAddr,
        input_buffer_size: usize,
        output_buffer_size: usize,
        sink: ChannelSink,
    ) -> Result<Self, MembershipError> {
        let group = multicast_group(session_id);
        let socket = create_socket(group, config)?;
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ChannelStats::default());

        let reader = socket.try_clone()?;
        let handle = {
            let running = running.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(format!("multicast-{group}"))
                .spawn(move || {
                    let by_owner = receive_loop(
                        reader,
                        session_id,
                        local_address,
                        input_buffer_size,
                        &running,
                        &stats,
                        &sink,
                    );
                    sink(ChannelEvent::Closed { by_owner });
                })?
        };

        tracing::info!(
            "Joined multicast group {}:{} for session {}",
            group,
            config.multicast_port,
            session_id
        );

        Ok(Self {
            socket,
            group,
            port: config.multicast_port,
            interface: config.interface,
            session_id,
            local_address,
            output_buffer_size,
            running,
            thread_handle: Mutex::new(Some(handle)),
            stats,
        })
    }

    pub fn group(&self) -> Ipv4Addr {
        self.group
    }

    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn send_join_request(&self, status: ManagerStatus) -> io::Result<()> {
        self.multicast(LocalMessage::JoinRequest {
            session_id: self.session_id,
            status,
        })
    }

    /// Unicast reply to one peer's join request
    pub fn send_join_response(&self, to: IpAddr, status: ManagerStatus) -> io::Result<()> {
        let msg = LocalMessage::JoinResponse {
            session_id: self.session_id,
            status,
        };
        self.send_to(msg, SocketAddr::new(to, self.port))
    }

    pub fn send_drop(&self) -> io::Result<()> {
        self.multicast(LocalMessage::Drop { session_id: self.session_id })
    }

    pub fn send_heartbeat(&self, status: ManagerStatus) -> io::Result<()> {
        self.multicast(LocalMessage::Heartbeat {
            session_id: self.session_id,
            status,
        })
    }

    pub fn send_app(&self, payload: &[u8]) -> Result<(), MembershipError> {
        if payload.len() > self.output_buffer_size {
            return Err(MembershipError::PayloadTooLarge(payload.len()));
        }
        self.multicast(LocalMessage::App {
            session_id: self.session_id,
            payload: Bytes::copy_from_slice(payload),
        })?;
        Ok(())
    }

    /// Send DROP, leave the group and stop the receive thread
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.send_drop() {
            tracing::debug!("DROP on {} failed: {}", self.group, e);
        }
        if let Err(e) = leave_group(&self.socket, self.group, self.interface) {
            tracing::debug!("Leaving {} failed: {}", self.group, e);
        }
        if let Some(handle) = self.thread_handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        tracing::info!("Left multicast group {}", self.group);
    }

    fn multicast(&self, msg: LocalMessage) -> io::Result<()> {
        self.send_to(msg, SocketAddr::from((self.group, self.port)))
    }

    fn send_to(&self, msg: LocalMessage, target: SocketAddr) -> io::Result<()> {
        let bytes = msg.encode();
        self.socket.send_to(&bytes, target)?;
        self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for MulticastChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn create_socket(group: Ipv4Addr, config: &MembershipConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Several hosts in one machine may share the port
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;

    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.multicast_port));
    socket.bind(&bind.into())?;

    let interface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.join_multicast_v4(&group, &interface)?;
    if let Some(interface) = config.interface {
        socket.set_multicast_if_v4(&interface)?;
    }
    // Subgroup traffic never leaves the LAN
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(config.multicast_loopback)?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;

    Ok(socket.into())
}

/// Mirrors the join in `create_socket`
fn leave_group(socket: &UdpSocket, group: Ipv4Addr, interface: Option<Ipv4Addr>) -> io::Result<()> {
    socket.leave_multicast_v4(&group, &interface.unwrap_or(Ipv4Addr::UNSPECIFIED))
}

/// Address this host is known by inside the subgroup: the configured
/// interface, else the source address the OS would route to the group,
/// else loopback.
pub fn resolve_local_address(config: &MembershipConfig, session_id: i32) -> IpAddr {
    if let Some(interface) = config.interface {
        return IpAddr::V4(interface);
    }
    let group = multicast_group(session_id);
    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|probe| {
            probe.connect((group, config.multicast_port))?;
            probe.local_addr()
        })
        .map(|addr| addr.ip());
    match routed {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            tracing::debug!("No route to {}: {}, using loopback", group, e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Returns whether the loop ended because the owner closed the channel
fn receive_loop(
    socket: UdpSocket,
    session_id: i32,
    local_address: IpAddr,
    input_buffer_size: usize,
    running: &AtomicBool,
    stats: &ChannelStats,
    sink: &ChannelSink,
) -> bool {
    // One spare byte so oversized APP datagrams are detectable
    let mut buf = vec![0u8; input_buffer_size + HEADER_LEN + 1];

    while running.load(Ordering::SeqCst) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!("Multicast receive failed: {}", e);
                    running.store(false, Ordering::SeqCst);
                    return false;
                }
                break;
            }
        };
        stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        // Our own traffic looped back
        if from.ip() == local_address {
            continue;
        }
        if len > input_buffer_size + HEADER_LEN {
            stats.datagrams_discarded.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let msg = match LocalMessage::decode(&buf[..len]) {
            Some(msg) if msg.accepted_by(session_id) => msg,
            _ => {
                stats.datagrams_discarded.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Discarded {} byte datagram from {}", len, from);
                continue;
            }
        };

        let from = from.ip();
        let event = match msg {
            LocalMessage::JoinRequest { status, .. } => ChannelEvent::JoinRequest { from, status },
            LocalMessage::JoinResponse { status, .. } => ChannelEvent::JoinResponse { from, status },
            LocalMessage::Drop { .. } => ChannelEvent::Drop { from },
            LocalMessage::Heartbeat { status, .. } => ChannelEvent::Heartbeat { from, status },
            LocalMessage::App { payload, .. } => ChannelEvent::App { from, payload },
        };
        sink(event);
    }
    true
}
