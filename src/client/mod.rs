//! Bridge client: one subgroup membership plus one remote session
//!
//! All role transitions go through a single-consumer [`ClientTask`] queue;
//! only the dispatcher thread changes the manager flag. Packet routing
//! reads that flag from any thread.

pub mod demux;

use bytes::Bytes;
use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::liveness::LinkSupervisor;
use crate::local::membership::{GroupMembership, LocalPeer, MembershipEvent};
use crate::remote::link::connect;
use crate::remote::session::{RemoteSession, SessionEvent};

pub use demux::ChannelDemux;

/// Role transitions, processed in order by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTask {
    BecomeManager,
    LostManager,
    NewManager,
    ConnectionInitialized,
    ConnectionLost,
}

impl ClientTask {
    fn from_membership(event: &MembershipEvent) -> Option<Self> {
        match event {
            MembershipEvent::BecameManager => Some(Self::BecomeManager),
            MembershipEvent::LostManagership { .. } | MembershipEvent::ManagerChanged { .. } => {
                Some(Self::NewManager)
            }
            MembershipEvent::NoManager => Some(Self::LostManager),
            MembershipEvent::Packet { .. } => None,
        }
    }

    fn from_session(event: &SessionEvent) -> Option<Self> {
        match event {
            SessionEvent::Initialized { .. } => Some(Self::ConnectionInitialized),
            SessionEvent::ConnectionLost => Some(Self::ConnectionLost),
            _ => None,
        }
    }
}

/// Application callback for every payload reaching this host
pub type PacketHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// What the client needs from the subgroup side
pub trait LocalControl: Send + Sync {
    fn set_can_manage(&self, can_manage: bool);
    fn send_packet(&self, payload: &[u8]) -> Result<()>;
}

/// What the client needs from the WAN side
pub trait RemoteControl: Send + Sync {
    fn is_open(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn send_packet(&self, payload: &[u8]) -> Result<()>;
}

impl LocalControl for GroupMembership {
    fn set_can_manage(&self, can_manage: bool) {
        GroupMembership::set_can_manage(self, can_manage)
    }

    fn send_packet(&self, payload: &[u8]) -> Result<()> {
        Ok(GroupMembership::send(self, payload)?)
    }
}

impl RemoteControl for RemoteSession {
    fn is_open(&self) -> bool {
        RemoteSession::is_open(self)
    }

    fn set_enabled(&self, enabled: bool) {
        RemoteSession::set_enabled(self, enabled)
    }

    fn send_packet(&self, payload: &[u8]) -> Result<()> {
        Ok(RemoteSession::send_data(self, payload)?)
    }
}

/// Subgroup traffic reaches the WAN only through the manager.
/// Returns whether the payload was handed to the remote side.
pub fn bridge_to_remote<R: RemoteControl + ?Sized>(is_manager: bool, remote: &R, payload: &[u8]) -> bool {
    if !is_manager {
        return false;
    }
    match remote.send_packet(payload) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Forward to remote failed: {}", e);
            false
        }
    }
}

/// WAN traffic is re-multicast only by the manager
pub fn bridge_to_local<L: LocalControl + ?Sized>(is_manager: bool, local: &L, payload: &[u8]) -> bool {
    if !is_manager {
        return false;
    }
    match local.send_packet(payload) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Forward to subgroup failed: {}", e);
            false
        }
    }
}

/// Follow-up work the dispatcher cannot do inline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    None,
    Reconnect,
}

/// Role state machine driven by [`ClientTask`]s
pub struct TaskProcessor<L: LocalControl, R: RemoteControl> {
    local: Arc<L>,
    remote: Arc<R>,
    is_manager: Arc<AtomicBool>,
    grace_period: Duration,
    grace: Option<Receiver<Instant>>,
}

impl<L: LocalControl, R: RemoteControl> TaskProcessor<L, R> {
    pub fn new(local: Arc<L>, remote: Arc<R>, is_manager: Arc<AtomicBool>, grace_period: Duration) -> Self {
        Self {
            local,
            remote,
            is_manager,
            grace_period,
            grace: None,
        }
    }

    pub fn is_manager(&self) -> bool {
        self.is_manager.load(Ordering::SeqCst)
    }

    pub fn grace_pending(&self) -> bool {
        self.grace.is_some()
    }

    /// Grace timer channel for the dispatcher's select; never fires if unset
    pub fn grace_timer(&self) -> Receiver<Instant> {
        self.grace.clone().unwrap_or_else(never)
    }

    pub fn handle(&mut self, task: ClientTask) -> Directive {
        tracing::debug!("Client task {:?}", task);
        match task {
            ClientTask::BecomeManager => {
                if self.remote.is_open() {
                    tracing::info!("This host is now the subgroup manager");
                    self.is_manager.store(true, Ordering::SeqCst);
                    self.remote.set_enabled(true);
                } else {
                    // No WAN path: refuse the role
                    tracing::info!("Elected manager without a remote connection, stepping down");
                    self.is_manager.store(false, Ordering::SeqCst);
                    self.remote.set_enabled(false);
                    self.local.set_can_manage(false);
                }
            }
            ClientTask::LostManager => {
                self.is_manager.store(false, Ordering::SeqCst);
                self.grace = Some(after(self.grace_period));
            }
            ClientTask::NewManager => {
                self.is_manager.store(false, Ordering::SeqCst);
                self.grace = None;
                self.remote.set_enabled(false);
            }
            ClientTask::ConnectionInitialized => self.local.set_can_manage(true),
            ClientTask::ConnectionLost => {
                self.local.set_can_manage(false);
                return Directive::Reconnect;
            }
        }
        Directive::None
    }

    /// No manager appeared in time: keep WAN bridging alive anyway
    pub fn grace_expired(&mut self) {
        self.grace = None;
        tracing::info!("No manager elected within {:?}, enabling remote link", self.grace_period);
        self.remote.set_enabled(true);
    }
}

/// Where an outbound packet goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Both,
    Remote,
    Local,
}

pub fn route(is_manager: bool, remote_open: bool, remote_enabled: bool) -> Route {
    if is_manager {
        Route::Both
    } else if remote_open && remote_enabled {
        Route::Remote
    } else {
        Route::Local
    }
}

struct ClientInner {
    config: BridgeConfig,
    membership: Arc<GroupMembership>,
    remote: Arc<RemoteSession>,
    links: Arc<LinkSupervisor>,
    is_manager: Arc<AtomicBool>,
    tasks: Sender<ClientTask>,
    handler: PacketHandler,
    running: AtomicBool,
    connecting: Mutex<()>,
}

impl ClientInner {
    fn enqueue(&self, task: ClientTask) {
        if self.tasks.send(task).is_err() {
            tracing::debug!("Dispatcher gone, dropping {:?}", task);
        }
    }

    fn on_membership_event(&self, event: MembershipEvent) {
        if let MembershipEvent::Packet { from, payload } = event {
            tracing::trace!("{} bytes from subgroup peer {}", payload.len(), from);
            bridge_to_remote(self.is_manager.load(Ordering::SeqCst), &*self.remote, &payload);
            (self.handler)(payload);
            return;
        }
        if let Some(task) = ClientTask::from_membership(&event) {
            self.enqueue(task);
        }
    }

    fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Packet(payload) => {
                tracing::trace!("{} bytes from remote", payload.len());
                bridge_to_local(self.is_manager.load(Ordering::SeqCst), &*self.membership, &payload);
                (self.handler)(payload);
            }
            SessionEvent::StatusChanged { enabled } => {
                tracing::debug!("Remote peer set enabled={}", enabled);
            }
            other => {
                if let Some(task) = ClientTask::from_session(&other) {
                    self.enqueue(task);
                }
            }
        }
    }

    /// Build a fresh link and run the handshake, unless already connected
    fn connect_remote(&self) {
        let _guard = self.connecting.lock();
        if !self.running.load(Ordering::SeqCst) || self.remote.is_open() {
            return;
        }
        let link = connect(&self.config.remote, &self.config.link_config(), self.remote.link_sink());
        tracing::info!(
            "Connecting to {} over {} (link {})",
            self.config.remote.remote_address,
            self.config.remote.protocol,
            link.id()
        );
        if let Some(old) = self.remote.set_link(link.clone()) {
            self.links.deregister(old.id());
        }
        match self.remote.initialize() {
            Ok(()) => self.links.register(link),
            // Connection-lost was queued and schedules the next attempt
            Err(e) => tracing::warn!("Remote connection failed: {}", e),
        }
    }
}

/// Client handle; dropping it shuts the bridge down
pub struct BridgeClient {
    inner: Arc<ClientInner>,
    stop_tx: Option<Sender<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl BridgeClient {
    /// Start membership, remote connection and dispatcher. Returns once the
    /// threads are running; joining and connecting continue in background.
    pub fn start(config: BridgeConfig, handler: PacketHandler) -> Result<Self> {
        config.validate()?;
        let (task_tx, task_rx) = unbounded();
        let links = LinkSupervisor::start(&config.heartbeat)?;

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let on_membership = weak.clone();
            let membership = GroupMembership::new(
                config.session_id,
                config.membership.clone(),
                config.heartbeat.clone(),
                config.input_buffer_size,
                config.output_buffer_size,
                Arc::new(move |event: MembershipEvent| {
                    if let Some(inner) = on_membership.upgrade() {
                        inner.on_membership_event(event);
                    }
                }),
            );
            let on_session = weak.clone();
            let remote = RemoteSession::new(
                config.session_id,
                Arc::new(move |event: SessionEvent| {
                    if let Some(inner) = on_session.upgrade() {
                        inner.on_session_event(event);
                    }
                }),
            );
            ClientInner {
                config,
                membership,
                remote,
                links,
                is_manager: Arc::new(AtomicBool::new(false)),
                tasks: task_tx,
                handler,
                running: AtomicBool::new(true),
                connecting: Mutex::new(()),
            }
        });

        inner.remote.set_enabled(true);
        inner.membership.set_can_manage(true);

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let dispatcher = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("bridge-dispatcher".into())
                .spawn(move || dispatch_loop(inner, task_rx, stop_rx))?
        };

        spawn_connector(inner.clone(), Duration::ZERO)?;

        let membership = inner.membership.clone();
        thread::Builder::new()
            .name("membership-join".into())
            .spawn(move || {
                if let Err(e) = membership.join() {
                    tracing::warn!("Subgroup join abandoned: {}", e);
                }
            })?;

        tracing::info!(
            "Bridge client started for session {} via {}",
            inner.config.session_id,
            inner.config.remote.remote_address
        );

        Ok(Self {
            inner,
            stop_tx: Some(stop_tx),
            dispatcher: Some(dispatcher),
        })
    }

    /// Route one application payload
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let route = route(
            inner.is_manager.load(Ordering::SeqCst),
            inner.remote.is_open(),
            inner.remote.is_enabled(),
        );
        tracing::trace!("Sending {} bytes via {:?}", payload.len(), route);
        match route {
            Route::Both => {
                let remote = inner.remote.send_data(payload).map_err(Error::from);
                let local = inner.membership.send(payload).map_err(Error::from);
                remote.and(local)
            }
            Route::Remote => Ok(inner.remote.send_data(payload)?),
            Route::Local => Ok(inner.membership.send(payload)?),
        }
    }

    pub fn is_manager(&self) -> bool {
        self.inner.is_manager.load(Ordering::SeqCst)
    }

    pub fn is_remote_open(&self) -> bool {
        self.inner.remote.is_open()
    }

    pub fn is_local_ready(&self) -> bool {
        self.inner.membership.is_ready()
    }

    pub fn current_manager(&self) -> Option<IpAddr> {
        self.inner.membership.current_manager()
    }

    pub fn peers(&self) -> Vec<LocalPeer> {
        self.inner.membership.peers()
    }

    pub fn session_id(&self) -> i32 {
        self.inner.config.session_id
    }

    /// Leave the subgroup, drop the remote session and stop all threads
    pub fn shutdown(&mut self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down bridge client");
        self.stop_tx.take();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        self.inner.membership.deactivate();
        self.inner.remote.close();
        self.inner.links.stop();
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(inner: Arc<ClientInner>, tasks: Receiver<ClientTask>, stop: Receiver<()>) {
    let mut processor = TaskProcessor::new(
        inner.membership.clone(),
        inner.remote.clone(),
        inner.is_manager.clone(),
        inner.config.manager_grace(),
    );

    loop {
        let grace = processor.grace_timer();
        select! {
            recv(stop) -> _ => break,
            recv(tasks) -> task => match task {
                Ok(task) => {
                    if processor.handle(task) == Directive::Reconnect {
                        if let Err(e) = spawn_connector(inner.clone(), inner.config.reconnect_delay()) {
                            tracing::error!("Failed to spawn reconnect thread: {}", e);
                        }
                    }
                }
                Err(_) => break,
            },
            recv(grace) -> _ => processor.grace_expired(),
        }
    }
    tracing::debug!("Dispatcher stopped");
}

fn spawn_connector(inner: Arc<ClientInner>, delay: Duration) -> std::io::Result<()> {
    thread::Builder::new()
        .name("remote-connector".into())
        .spawn(move || {
            if !delay.is_zero() {
                tracing::debug!("Reconnecting in {:?}", delay);
                thread::sleep(delay);
            }
            inner.connect_remote();
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeLocal {
        can_manage: Mutex<Vec<bool>>,
        multicast: Mutex<Vec<Bytes>>,
    }

    impl LocalControl for FakeLocal {
        fn set_can_manage(&self, can_manage: bool) {
            self.can_manage.lock().push(can_manage);
        }

        fn send_packet(&self, payload: &[u8]) -> Result<()> {
            self.multicast.lock().push(Bytes::copy_from_slice(payload));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRemote {
        open: AtomicBool,
        enabled: Mutex<Vec<bool>>,
        calls: AtomicUsize,
        sent: Mutex<Vec<Bytes>>,
    }

    impl RemoteControl for FakeRemote {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn set_enabled(&self, enabled: bool) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.enabled.lock().push(enabled);
        }

        fn send_packet(&self, payload: &[u8]) -> Result<()> {
            if !self.is_open() {
                return Err(LinkError::NotOpen.into());
            }
            self.sent.lock().push(Bytes::copy_from_slice(payload));
            Ok(())
        }
    }

    fn processor(remote_open: bool) -> (TaskProcessor<FakeLocal, FakeRemote>, Arc<FakeLocal>, Arc<FakeRemote>) {
        let local = Arc::new(FakeLocal::default());
        let remote = Arc::new(FakeRemote::default());
        remote.open.store(remote_open, Ordering::SeqCst);
        let processor = TaskProcessor::new(
            local.clone(),
            remote.clone(),
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(50),
        );
        (processor, local, remote)
    }

    #[test]
    fn test_become_manager_with_connection() {
        let (mut processor, local, remote) = processor(true);
        assert_eq!(processor.handle(ClientTask::BecomeManager), Directive::None);
        assert!(processor.is_manager());
        assert_eq!(*remote.enabled.lock(), vec![true]);
        assert!(local.can_manage.lock().is_empty());
    }

    #[test]
    fn test_become_manager_without_connection_steps_down() {
        let (mut processor, local, remote) = processor(false);
        processor.handle(ClientTask::BecomeManager);
        assert!(!processor.is_manager());
        assert_eq!(*remote.enabled.lock(), vec![false]);
        assert_eq!(*local.can_manage.lock(), vec![false]);
    }

    #[test]
    fn test_new_manager_cancels_grace() {
        let (mut processor, _local, remote) = processor(true);
        processor.handle(ClientTask::BecomeManager);
        processor.handle(ClientTask::LostManager);
        assert!(!processor.is_manager());
        assert!(processor.grace_pending());

        processor.handle(ClientTask::NewManager);
        assert!(!processor.grace_pending());
        assert!(processor.grace_timer().recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(*remote.enabled.lock(), vec![true, false]);
    }

    #[test]
    fn test_grace_timer_reenables_remote() {
        let (mut processor, _local, remote) = processor(true);
        processor.handle(ClientTask::LostManager);
        let timer = processor.grace_timer();
        assert!(timer.recv_timeout(Duration::from_secs(1)).is_ok());
        processor.grace_expired();
        assert!(!processor.grace_pending());
        assert!(!processor.is_manager());
        assert_eq!(*remote.enabled.lock(), vec![true]);
    }

    #[test]
    fn test_connection_events_toggle_eligibility() {
        let (mut processor, local, remote) = processor(false);
        assert_eq!(processor.handle(ClientTask::ConnectionLost), Directive::Reconnect);
        assert_eq!(processor.handle(ClientTask::ConnectionInitialized), Directive::None);
        assert_eq!(*local.can_manage.lock(), vec![false, true]);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_only_manager_bridges_inbound_traffic() {
        let (mut processor, local, remote) = processor(true);

        // Not yet elected: both directions stay put
        assert!(!bridge_to_remote(processor.is_manager(), &*remote, b"lan-1"));
        assert!(!bridge_to_local(processor.is_manager(), &*local, b"wan-1"));

        processor.handle(ClientTask::BecomeManager);
        assert!(bridge_to_remote(processor.is_manager(), &*remote, b"lan-2"));
        assert!(bridge_to_local(processor.is_manager(), &*local, b"wan-2"));

        processor.handle(ClientTask::NewManager);
        assert!(!bridge_to_remote(processor.is_manager(), &*remote, b"lan-3"));
        assert!(!bridge_to_local(processor.is_manager(), &*local, b"wan-3"));

        assert_eq!(*remote.sent.lock(), vec![Bytes::from_static(b"lan-2")]);
        assert_eq!(*local.multicast.lock(), vec![Bytes::from_static(b"wan-2")]);
    }

    #[test]
    fn test_failed_remote_forward_reported() {
        let (_processor, _local, remote) = processor(false);
        assert!(!bridge_to_remote(true, &*remote, b"lan"));
        assert!(remote.sent.lock().is_empty());
    }

    #[test]
    fn test_routing_table() {
        assert_eq!(route(true, false, false), Route::Both);
        assert_eq!(route(true, true, true), Route::Both);
        assert_eq!(route(false, true, true), Route::Remote);
        assert_eq!(route(false, true, false), Route::Local);
        assert_eq!(route(false, false, true), Route::Local);
    }

    #[test]
    fn test_membership_events_map_to_tasks() {
        let addr: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(
            ClientTask::from_membership(&MembershipEvent::BecameManager),
            Some(ClientTask::BecomeManager)
        );
        assert_eq!(
            ClientTask::from_membership(&MembershipEvent::LostManagership { new_manager: addr }),
            Some(ClientTask::NewManager)
        );
        assert_eq!(
            ClientTask::from_membership(&MembershipEvent::ManagerChanged { manager: addr }),
            Some(ClientTask::NewManager)
        );
        assert_eq!(
            ClientTask::from_membership(&MembershipEvent::NoManager),
            Some(ClientTask::LostManager)
        );
        assert_eq!(
            ClientTask::from_session(&SessionEvent::ConnectionLost),
            Some(ClientTask::ConnectionLost)
        );
        assert_eq!(ClientTask::from_session(&SessionEvent::StatusChanged { enabled: true }), None);
    }
}
