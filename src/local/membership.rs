//! Subgroup membership and manager election
//!
//! [`MembershipState`] is the peer table and election algorithm with no I/O:
//! every handler returns the [`Action`]s to perform. [`GroupMembership`]
//! owns one state behind a single mutex, applies those actions on the
//! multicast channel, runs the join protocol and drives liveness.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use crate::config::{HeartbeatConfig, MembershipConfig};
use crate::error::MembershipError;
use crate::liveness::{LivenessSupervisor, LivenessTarget};
use crate::local::channel::{resolve_local_address, ChannelEvent, MulticastChannel};
use crate::protocol::ManagerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// The local host; never evicted
    ThisHost,
    Remote,
}

/// One host seen on the multicast channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    pub address: IpAddr,
    pub active: bool,
    pub status: ManagerStatus,
    pub kind: PeerKind,
}

/// Notifications for the owner of a [`GroupMembership`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    BecameManager,
    LostManagership { new_manager: IpAddr },
    ManagerChanged { manager: IpAddr },
    NoManager,
    Packet { from: IpAddr, payload: Bytes },
}

/// Side effect requested by [`MembershipState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Heartbeat(ManagerStatus),
    JoinResponse { to: IpAddr, status: ManagerStatus },
    Notify(MembershipEvent),
}

/// Peer table, manager slot and readiness of one subgroup
#[derive(Debug, Clone)]
pub struct MembershipState {
    this_host: IpAddr,
    peers: HashMap<IpAddr, LocalPeer>,
    manager: Option<IpAddr>,
    joining: bool,
    ready: bool,
}

impl MembershipState {
    pub fn new(this_host: IpAddr, status: ManagerStatus) -> Self {
        let mut peers = HashMap::new();
        peers.insert(
            this_host,
            LocalPeer {
                address: this_host,
                active: true,
                status,
                kind: PeerKind::ThisHost,
            },
        );
        Self {
            this_host,
            peers,
            manager: None,
            joining: false,
            ready: false,
        }
    }

    /// Start a new join: table back to just this host, not ready
    pub fn reset(&mut self) {
        let status = match self.status() {
            ManagerStatus::CannotManage => ManagerStatus::CannotManage,
            _ => ManagerStatus::CanManage,
        };
        *self = Self::new(self.this_host, status);
        self.joining = true;
    }

    /// Leave the subgroup; pending joins give up
    pub fn deactivate(&mut self) {
        self.joining = false;
        self.ready = false;
        self.manager = None;
    }

    pub fn this_host(&self) -> IpAddr {
        self.this_host
    }

    pub fn status(&self) -> ManagerStatus {
        self.peers
            .get(&self.this_host)
            .map(|p| p.status)
            .unwrap_or(ManagerStatus::CannotManage)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_joining(&self) -> bool {
        self.joining
    }

    pub fn manager(&self) -> Option<IpAddr> {
        self.manager
    }

    pub fn peer(&self, address: &IpAddr) -> Option<&LocalPeer> {
        self.peers.get(address)
    }

    /// Snapshot sorted by address
    pub fn peers(&self) -> Vec<LocalPeer> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| rank(&p.address));
        peers
    }

    pub fn on_join_request(&mut self, from: IpAddr, status: ManagerStatus) -> Vec<Action> {
        if from == self.this_host {
            return Vec::new();
        }
        self.upsert(from, status);
        let mut actions = self.elect_if_ready().0;
        actions.push(Action::JoinResponse {
            to: from,
            status: self.status(),
        });
        actions
    }

    /// JOIN_RESPONSE and HEARTBEAT share handling
    pub fn on_status(&mut self, from: IpAddr, status: ManagerStatus) -> Vec<Action> {
        if from == self.this_host {
            return Vec::new();
        }
        self.upsert(from, status);
        if self.ready {
            self.elect().0
        } else if self.joining && status == ManagerStatus::IsManager {
            tracing::debug!("Found manager {} while joining", from);
            self.finish_join()
        } else {
            Vec::new()
        }
    }

    pub fn on_drop(&mut self, from: IpAddr) -> Vec<Action> {
        if from == self.this_host || self.peers.remove(&from).is_none() {
            return Vec::new();
        }
        tracing::debug!("Peer {} left the subgroup", from);
        self.elect_if_ready().0
    }

    pub fn on_app(&mut self, from: IpAddr, payload: Bytes) -> Vec<Action> {
        if !self.ready || from == self.this_host {
            return Vec::new();
        }
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.active = true;
        }
        vec![Action::Notify(MembershipEvent::Packet { from, payload })]
    }

    /// Join timer fired without an existing manager answering
    pub fn join_timed_out(&mut self) -> Vec<Action> {
        if self.ready || !self.joining {
            return Vec::new();
        }
        if self.status().is_eligible() {
            self.set_own_status(ManagerStatus::IsManager);
        }
        self.finish_join()
    }

    pub fn finish_join(&mut self) -> Vec<Action> {
        self.joining = false;
        self.ready = true;
        self.elect().0
    }

    pub fn set_can_manage(&mut self, can_manage: bool) -> Vec<Action> {
        let status = self.status();
        let new_status = match (can_manage, status) {
            (true, ManagerStatus::CannotManage) => ManagerStatus::CanManage,
            (false, ManagerStatus::CanManage | ManagerStatus::IsManager) => {
                ManagerStatus::CannotManage
            }
            _ => return Vec::new(),
        };
        self.set_own_status(new_status);
        if !self.ready {
            return Vec::new();
        }

        let (mut actions, broadcast) = self.elect();
        if !broadcast {
            actions.insert(0, Action::Heartbeat(self.status()));
        }
        actions
    }

    /// Periodic heartbeat: refreshes this host and announces its status
    pub fn heartbeat_tick(&mut self) -> Vec<Action> {
        if let Some(me) = self.peers.get_mut(&self.this_host) {
            me.active = true;
        }
        if self.ready {
            vec![Action::Heartbeat(self.status())]
        } else {
            Vec::new()
        }
    }

    /// Liveness sweep: evict peers silent for a whole window, clear the rest
    pub fn sweep(&mut self) -> Vec<Action> {
        let mut evicted = Vec::new();
        self.peers.retain(|address, peer| {
            if peer.kind == PeerKind::ThisHost {
                return true;
            }
            if peer.active {
                peer.active = false;
                true
            } else {
                evicted.push(*address);
                false
            }
        });
        if evicted.is_empty() {
            return Vec::new();
        }
        tracing::info!("Evicted inactive peers: {:?}", evicted);
        self.elect_if_ready().0
    }

    /// Run the election. Returns the actions and whether a heartbeat was
    /// queued because the manager changed.
    pub fn elect(&mut self) -> (Vec<Action>, bool) {
        let claimants: Vec<IpAddr> = self
            .peers
            .values()
            .filter(|p| p.status == ManagerStatus::IsManager)
            .map(|p| p.address)
            .collect();

        let candidate = match claimants.iter().max_by_key(|a| rank(a)).copied() {
            Some(winner) => {
                for address in claimants.iter().filter(|a| **a != winner) {
                    if let Some(peer) = self.peers.get_mut(address) {
                        peer.status = ManagerStatus::CanManage;
                    }
                }
                Some(winner)
            }
            None => self
                .peers
                .values()
                .filter(|p| p.status == ManagerStatus::CanManage)
                .map(|p| p.address)
                .max_by_key(rank),
        };

        if candidate == self.manager {
            return (Vec::new(), false);
        }

        let previous = self.manager;
        if let Some(address) = candidate {
            if let Some(peer) = self.peers.get_mut(&address) {
                peer.status = ManagerStatus::IsManager;
            }
        }

        let event = match candidate {
            Some(address) if address == self.this_host => MembershipEvent::BecameManager,
            Some(address) if previous == Some(self.this_host) => {
                MembershipEvent::LostManagership { new_manager: address }
            }
            Some(address) => MembershipEvent::ManagerChanged { manager: address },
            None => MembershipEvent::NoManager,
        };
        tracing::debug!("Manager {:?} -> {:?}", previous, candidate);
        self.manager = candidate;

        (
            vec![Action::Heartbeat(self.status()), Action::Notify(event)],
            true,
        )
    }

    fn elect_if_ready(&mut self) -> (Vec<Action>, bool) {
        if self.ready {
            self.elect()
        } else {
            (Vec::new(), false)
        }
    }

    fn upsert(&mut self, address: IpAddr, status: ManagerStatus) {
        let peer = self.peers.entry(address).or_insert_with(|| {
            tracing::debug!("New peer {} ({})", address, status);
            LocalPeer {
                address,
                active: true,
                status,
                kind: PeerKind::Remote,
            }
        });
        peer.active = true;
        peer.status = status;
    }

    fn set_own_status(&mut self, status: ManagerStatus) {
        if let Some(me) = self.peers.get_mut(&self.this_host) {
            me.status = status;
        }
    }
}

/// Total order used by the election: the address string
fn rank(address: &IpAddr) -> String {
    address.to_string()
}

/// Receives membership notifications. Called with the membership lock held
/// for everything except [`MembershipEvent::Packet`], so it must only enqueue
/// and never call back into the membership.
pub type MembershipSink = Arc<dyn Fn(MembershipEvent) + Send + Sync>;

/// Membership of this host in one session's multicast subgroup
pub struct GroupMembership {
    me: Weak<Self>,
    session_id: i32,
    config: MembershipConfig,
    heartbeat: HeartbeatConfig,
    input_buffer_size: usize,
    output_buffer_size: usize,
    state: Mutex<MembershipState>,
    ready_cond: Condvar,
    channel: RwLock<Option<Arc<MulticastChannel>>>,
    liveness: Mutex<Option<LivenessSupervisor>>,
    active: AtomicBool,
    sink: MembershipSink,
}

impl GroupMembership {
    pub fn new(
        session_id: i32,
        config: MembershipConfig,
        heartbeat: HeartbeatConfig,
        input_buffer_size: usize,
        output_buffer_size: usize,
        sink: MembershipSink,
    ) -> Arc<Self> {
        let this_host = resolve_local_address(&config, session_id);
        tracing::info!("Subgroup address of this host: {}", this_host);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session_id,
            config,
            heartbeat,
            input_buffer_size,
            output_buffer_size,
            state: Mutex::new(MembershipState::new(this_host, ManagerStatus::CanManage)),
            ready_cond: Condvar::new(),
            channel: RwLock::new(None),
            liveness: Mutex::new(None),
            active: AtomicBool::new(true),
            sink,
        })
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn this_host(&self) -> IpAddr {
        self.state.lock().this_host()
    }

    pub fn status(&self) -> ManagerStatus {
        self.state.lock().status()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().is_ready()
    }

    pub fn current_manager(&self) -> Option<IpAddr> {
        self.state.lock().manager()
    }

    pub fn peers(&self) -> Vec<LocalPeer> {
        self.state.lock().peers()
    }

    /// Run the join protocol, blocking until this host is part of the
    /// subgroup. I/O failures are retried after the rejoin delay.
    pub fn join(&self) -> Result<(), MembershipError> {
        if self.session_id <= 0 {
            return Err(MembershipError::InvalidSessionId(self.session_id));
        }

        loop {
            if !self.active.load(Ordering::SeqCst) {
                return Err(MembershipError::NotReady);
            }
            self.stop_liveness();
            self.close_channel();

            let status = {
                let mut state = self.state.lock();
                state.reset();
                state.status()
            };

            let channel = match self.open_channel() {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!("Opening multicast channel failed: {}, retrying", e);
                    thread::sleep(self.config.rejoin_delay());
                    continue;
                }
            };
            if let Err(e) = channel.send_join_request(status) {
                tracing::warn!("JOIN_REQUEST failed: {}, retrying", e);
                self.close_channel();
                thread::sleep(self.config.rejoin_delay());
                continue;
            }
            tracing::debug!("Sent JOIN_REQUEST ({}) for session {}", status, self.session_id);

            let deadline = Instant::now() + self.config.join_timeout();
            {
                let mut state = self.state.lock();
                while state.is_joining() && !state.is_ready() {
                    if self.ready_cond.wait_until(&mut state, deadline).timed_out() {
                        tracing::debug!("No manager answered, completing join");
                        let actions = state.join_timed_out();
                        self.apply(actions);
                        break;
                    }
                }
                if !state.is_ready() {
                    return Err(MembershipError::NotReady);
                }
            }

            self.start_liveness();
            tracing::info!("Joined subgroup of session {}", self.session_id);
            return Ok(());
        }
    }

    /// Send an application payload to the subgroup
    pub fn send(&self, payload: &[u8]) -> Result<(), MembershipError> {
        if !self.is_ready() {
            return Err(MembershipError::NotReady);
        }
        match self.channel.read().as_ref() {
            Some(channel) => channel.send_app(payload),
            None => Err(MembershipError::NotReady),
        }
    }

    /// Toggle this host's eligibility for the manager role
    pub fn set_can_manage(&self, can_manage: bool) {
        let mut state = self.state.lock();
        let actions = state.set_can_manage(can_manage);
        self.apply(actions);
    }

    /// Leave the subgroup for good
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            state.deactivate();
            self.ready_cond.notify_all();
        }
        self.stop_liveness();
        self.close_channel();
    }

    fn open_channel(&self) -> Result<Arc<MulticastChannel>, MembershipError> {
        let me = self.me.clone();
        let sink = Arc::new(move |event: ChannelEvent| {
            if let Some(membership) = me.upgrade() {
                membership.handle_channel_event(event);
            }
        });
        let channel = Arc::new(MulticastChannel::open(
            self.session_id,
            &self.config,
            self.this_host(),
            self.input_buffer_size,
            self.output_buffer_size,
            sink,
        )?);
        *self.channel.write() = Some(channel.clone());
        Ok(channel)
    }

    fn close_channel(&self) {
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            channel.close();
        }
    }

    fn start_liveness(&self) {
        match LivenessSupervisor::start("membership", self.me.clone(), &self.heartbeat) {
            Ok(supervisor) => *self.liveness.lock() = Some(supervisor),
            Err(e) => tracing::error!("Failed to start membership liveness: {}", e),
        }
    }

    fn stop_liveness(&self) {
        let supervisor = self.liveness.lock().take();
        if let Some(mut supervisor) = supervisor {
            supervisor.stop();
        }
    }

    fn handle_channel_event(&self, event: ChannelEvent) {
        let mut state = self.state.lock();
        let actions = match event {
            ChannelEvent::JoinRequest { from, status } => state.on_join_request(from, status),
            ChannelEvent::JoinResponse { from, status } | ChannelEvent::Heartbeat { from, status } => {
                state.on_status(from, status)
            }
            ChannelEvent::Drop { from } => state.on_drop(from),
            ChannelEvent::App { from, payload } => {
                let actions = state.on_app(from, payload);
                // Packets go out without the lock so the owner may send
                drop(state);
                self.apply(actions);
                return;
            }
            ChannelEvent::Closed { by_owner } => {
                drop(state);
                self.channel_closed(by_owner);
                return;
            }
        };
        self.apply(actions);
        if state.is_ready() {
            self.ready_cond.notify_all();
        }
    }

    fn channel_closed(&self, by_owner: bool) {
        if by_owner || !self.active.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!("Multicast channel closed unexpectedly, rejoining");
        let Some(membership) = self.me.upgrade() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name("membership-rejoin".into())
            .spawn(move || {
                if let Err(e) = membership.join() {
                    tracing::warn!("Rejoin abandoned: {}", e);
                }
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn rejoin thread: {}", e);
        }
    }

    fn apply(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Heartbeat(status) => self.with_channel(|c| c.send_heartbeat(status)),
                Action::JoinResponse { to, status } => {
                    self.with_channel(|c| c.send_join_response(to, status))
                }
                Action::Notify(event) => (self.sink)(event),
            }
        }
    }

    fn with_channel(&self, send: impl FnOnce(&MulticastChannel) -> std::io::Result<()>) {
        if let Some(channel) = self.channel.read().as_ref() {
            if let Err(e) = send(channel) {
                tracing::warn!("Multicast send failed: {}", e);
            }
        }
    }
}

impl LivenessTarget for GroupMembership {
    fn send_heartbeat(&self) {
        let mut state = self.state.lock();
        let actions = state.heartbeat_tick();
        self.apply(actions);
    }

    fn sweep(&self) {
        let mut state = self.state.lock();
        let actions = state.sweep();
        self.apply(actions);
    }
}
