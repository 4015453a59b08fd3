//! Handshake state machine over one remote link
//!
//! Control payloads are a 2-byte type followed by a fixed body:
//! `INITIALIZE` carries the 4-byte session id, `ENABLE` one boolean byte,
//! `DROP` nothing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::LinkError;
use crate::remote::link::{LinkEvent, LinkId, LinkSink, RemoteLink};

pub const INITIALIZE: u16 = 1;
pub const DROP: u16 = 2;
pub const ENABLE: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Initialize { session_id: i32 },
    Drop,
    Enable(bool),
}

impl ControlMessage {
    pub fn encode(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        match self {
            Self::Initialize { session_id } => {
                buf.put_u16(INITIALIZE);
                buf.put_i32(session_id);
            }
            Self::Drop => buf.put_u16(DROP),
            Self::Enable(enabled) => {
                buf.put_u16(ENABLE);
                buf.put_u8(enabled as u8);
            }
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, LinkError> {
        let mut buf = payload;
        if buf.remaining() < 2 {
            return Err(LinkError::Malformed("control message without type"));
        }
        match (buf.get_u16(), buf.remaining()) {
            (INITIALIZE, 4) => Ok(Self::Initialize {
                session_id: buf.get_i32(),
            }),
            (DROP, 0) => Ok(Self::Drop),
            (ENABLE, 1) => Ok(Self::Enable(buf.get_u8() != 0)),
            (INITIALIZE | DROP | ENABLE, _) => {
                Err(LinkError::Malformed("control message of wrong length"))
            }
            (other, _) => Err(LinkError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
}

/// Notifications for the owner of a [`RemoteSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Initialized { session_id: i32 },
    StatusChanged { enabled: bool },
    ConnectionLost,
    Packet(Bytes),
}

pub type SessionSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

struct SessionInner {
    state: SessionState,
    session_id: i32,
    link: Option<Arc<dyn RemoteLink>>,
}

/// Open/enabled/session-id handshake layered over a [`RemoteLink`]
pub struct RemoteSession {
    me: Weak<Self>,
    inner: Mutex<SessionInner>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    initializing: Mutex<()>,
    control: Mutex<()>,
    sink: SessionSink,
}

impl RemoteSession {
    pub fn new(session_id: i32, sink: SessionSink) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Closed,
                session_id,
                link: None,
            }),
            enabled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            initializing: Mutex::new(()),
            control: Mutex::new(()),
            sink,
        })
    }

    /// Sink to hand to a link so its events reach this session
    pub fn link_sink(&self) -> LinkSink {
        let me = self.me.clone();
        Arc::new(move |id: LinkId, event: LinkEvent| {
            if let Some(session) = me.upgrade() {
                session.handle_link_event(id, event);
            }
        })
    }

    /// Replace the underlying link, e.g. for a reconnect. Returns the old one.
    pub fn set_link(&self, link: Arc<dyn RemoteLink>) -> Option<Arc<dyn RemoteLink>> {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Closed;
        inner.link.replace(link)
    }

    pub fn link(&self) -> Option<Arc<dyn RemoteLink>> {
        self.inner.lock().link.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> i32 {
        self.inner.lock().session_id
    }

    /// Open the link and run the handshake. Blocks for the duration of the
    /// control exchanges; on failure the link is closed and connection-lost
    /// is reported.
    pub fn initialize(&self) -> Result<(), LinkError> {
        let _guard = self.initializing.lock();
        let (link, session_id) = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Closed || self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            let link = inner.link.clone().ok_or(LinkError::NotOpen)?;
            inner.state = SessionState::Opening;
            (link, inner.session_id)
        };

        let handshake = link
            .open()
            .and_then(|_| self.send_control_on(&link, ControlMessage::Initialize { session_id }));
        if let Err(e) = handshake {
            tracing::warn!("Handshake with {} failed: {}", link.peer_address(), e);
            {
                let mut inner = self.inner.lock();
                if inner.state == SessionState::Opening {
                    inner.state = SessionState::Closed;
                }
            }
            link.close();
            (self.sink)(SessionEvent::ConnectionLost);
            return Err(e);
        }

        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Opening || !same_link(&inner.link, &link) {
                return Err(LinkError::Closed);
            }
            inner.state = SessionState::Open;
        }

        let enabled = self.is_enabled();
        if let Err(e) = self.send_control_on(&link, ControlMessage::Enable(enabled)) {
            tracing::warn!("ENABLE({}) to {} failed: {}", enabled, link.peer_address(), e);
            self.connection_lost(link.id());
            return Err(e);
        }

        tracing::info!("Session {} initialized over link {}", session_id, link.id());
        (self.sink)(SessionEvent::Initialized { session_id });
        Ok(())
    }

    /// Update the local flag; sent to the peer immediately while open
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        let link = {
            let inner = self.inner.lock();
            if inner.state != SessionState::Open {
                return;
            }
            inner.link.clone()
        };
        if let Some(link) = link {
            if let Err(e) = self.send_control_on(&link, ControlMessage::Enable(enabled)) {
                tracing::warn!("ENABLE({}) to {} failed: {}", enabled, link.peer_address(), e);
            }
        }
    }

    pub fn send_data(&self, payload: &[u8]) -> Result<(), LinkError> {
        let link = {
            let inner = self.inner.lock();
            if inner.state != SessionState::Open {
                return Err(LinkError::NotOpen);
            }
            inner.link.clone().ok_or(LinkError::NotOpen)?
        };
        link.send_data(payload)
    }

    /// Stop for good: tell the peer, then close the link
    pub fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let (link, was_open) = {
            let mut inner = self.inner.lock();
            let was_open = inner.state == SessionState::Open;
            inner.state = SessionState::Closed;
            (inner.link.clone(), was_open)
        };
        if let Some(link) = link {
            if was_open {
                if let Err(e) = self.send_control_on(&link, ControlMessage::Drop) {
                    tracing::debug!("DROP to {} failed: {}", link.peer_address(), e);
                }
            }
            link.close();
        }
    }

    pub fn handle_link_event(&self, id: LinkId, event: LinkEvent) {
        let link = {
            let inner = self.inner.lock();
            match &inner.link {
                Some(link) if link.id() == id => link.clone(),
                _ => {
                    tracing::trace!("Ignoring event from superseded link {}", id);
                    return;
                }
            }
        };

        match event {
            LinkEvent::Data(payload) => (self.sink)(SessionEvent::Packet(payload)),
            LinkEvent::Control(payload) => match ControlMessage::decode(&payload) {
                Ok(ControlMessage::Initialize { session_id }) => {
                    {
                        let mut inner = self.inner.lock();
                        inner.state = SessionState::Open;
                        inner.session_id = session_id;
                    }
                    tracing::debug!("Peer {} initialized session {}", link.peer_address(), session_id);
                    (self.sink)(SessionEvent::Initialized { session_id });
                }
                Ok(ControlMessage::Enable(enabled)) => {
                    self.enabled.store(enabled, Ordering::SeqCst);
                    (self.sink)(SessionEvent::StatusChanged { enabled });
                }
                Ok(ControlMessage::Drop) => {
                    tracing::info!("Peer {} dropped the session", link.peer_address());
                    self.connection_lost(id);
                }
                Err(e) => {
                    tracing::warn!("Protocol violation from {}: {}", link.peer_address(), e);
                    link.close();
                }
            },
            LinkEvent::Closed => self.connection_lost(id),
        }
    }

    fn connection_lost(&self, id: LinkId) {
        let link = {
            let mut inner = self.inner.lock();
            let open = inner.state == SessionState::Open;
            match inner.link.clone() {
                Some(link) if link.id() == id && open => {
                    inner.state = SessionState::Closed;
                    link
                }
                _ => return,
            }
        };
        link.close();
        (self.sink)(SessionEvent::ConnectionLost);
    }

    fn send_control_on(&self, link: &Arc<dyn RemoteLink>, msg: ControlMessage) -> Result<(), LinkError> {
        let _guard = self.control.lock();
        link.send_control(&msg.encode())
    }
}

fn same_link(current: &Option<Arc<dyn RemoteLink>>, link: &Arc<dyn RemoteLink>) -> bool {
    current.as_ref().map(|l| l.id()) == Some(link.id())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::liveness::Activity;
    use crate::protocol::TransportKind;
    use crate::remote::link::LinkStats;
    use crossbeam_channel::{unbounded, Receiver};
    use std::net::SocketAddr;

    /// In-memory link recording what was sent
    pub(crate) struct MockLink {
        pub id: LinkId,
        pub open: AtomicBool,
        pub fail_control: AtomicBool,
        pub sent_control: Mutex<Vec<ControlMessage>>,
        pub sent_data: Mutex<Vec<Bytes>>,
        activity: Activity,
        stats: LinkStats,
    }

    impl MockLink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                id: LinkId::next(),
                open: AtomicBool::new(false),
                fail_control: AtomicBool::new(false),
                sent_control: Mutex::new(Vec::new()),
                sent_data: Mutex::new(Vec::new()),
                activity: Activity::new(),
                stats: LinkStats::default(),
            })
        }
    }

    impl RemoteLink for MockLink {
        fn id(&self) -> LinkId {
            self.id
        }
        fn peer_address(&self) -> SocketAddr {
            SocketAddr::from(([192, 0, 2, 1], 3333))
        }
        fn transport(&self) -> TransportKind {
            TransportKind::Udp
        }
        fn open(&self) -> Result<(), LinkError> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn send_data(&self, payload: &[u8]) -> Result<(), LinkError> {
            self.sent_data.lock().push(Bytes::copy_from_slice(payload));
            Ok(())
        }
        fn send_control(&self, payload: &[u8]) -> Result<(), LinkError> {
            if self.fail_control.load(Ordering::SeqCst) {
                return Err(LinkError::AckTimeout { attempts: 3 });
            }
            self.sent_control.lock().push(ControlMessage::decode(payload)?);
            Ok(())
        }
        fn send_heartbeat(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn activity(&self) -> &Activity {
            &self.activity
        }
        fn stats(&self) -> &LinkStats {
            &self.stats
        }
    }

    fn session_with_link(session_id: i32) -> (Arc<RemoteSession>, Arc<MockLink>, Receiver<SessionEvent>) {
        let (tx, rx) = unbounded();
        let session = RemoteSession::new(
            session_id,
            Arc::new(move |event: SessionEvent| {
                let _ = tx.send(event);
            }),
        );
        let link = MockLink::new();
        session.set_link(link.clone());
        (session, link, rx)
    }

    #[test]
    fn test_control_message_layouts() {
        assert_eq!(&ControlMessage::Initialize { session_id: 7 }.encode()[..], &[0, 1, 0, 0, 0, 7]);
        assert_eq!(&ControlMessage::Drop.encode()[..], &[0, 2]);
        assert_eq!(&ControlMessage::Enable(true).encode()[..], &[0, 4, 1]);
        assert_eq!(ControlMessage::decode(&[0, 4, 0]).unwrap(), ControlMessage::Enable(false));
        assert!(ControlMessage::decode(&[0, 1, 0, 7]).is_err());
        assert!(ControlMessage::decode(&[0, 2, 0]).is_err());
        assert!(matches!(
            ControlMessage::decode(&[0, 8]),
            Err(LinkError::UnknownMessageType(8))
        ));
    }

    #[test]
    fn test_initialize_handshake() {
        let (session, link, rx) = session_with_link(7);
        session.set_enabled(true);
        // Closed: only the local flag changed
        assert!(link.sent_control.lock().is_empty());

        session.initialize().unwrap();
        assert!(session.is_open());
        assert_eq!(
            *link.sent_control.lock(),
            vec![
                ControlMessage::Initialize { session_id: 7 },
                ControlMessage::Enable(true)
            ]
        );
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Initialized { session_id: 7 });

        session.set_enabled(false);
        assert_eq!(link.sent_control.lock().last(), Some(&ControlMessage::Enable(false)));
    }

    #[test]
    fn test_failed_handshake_reports_lost() {
        let (session, link, rx) = session_with_link(7);
        link.fail_control.store(true, Ordering::SeqCst);
        assert!(session.initialize().is_err());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!link.is_open());
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::ConnectionLost);
    }

    #[test]
    fn test_peer_initialize_opens() {
        let (session, link, rx) = session_with_link(0);
        session.handle_link_event(link.id, LinkEvent::Control(ControlMessage::Initialize { session_id: 9 }.encode()));
        assert!(session.is_open());
        assert_eq!(session.session_id(), 9);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Initialized { session_id: 9 });

        session.handle_link_event(link.id, LinkEvent::Control(ControlMessage::Enable(true).encode()));
        assert!(session.is_enabled());
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::StatusChanged { enabled: true });

        session.handle_link_event(link.id, LinkEvent::Data(Bytes::from_static(b"pkt")));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Packet(Bytes::from_static(b"pkt")));

        session.handle_link_event(link.id, LinkEvent::Control(ControlMessage::Drop.encode()));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::ConnectionLost);
        assert_eq!(session.state(), SessionState::Closed);
        // Closing the link afterwards does not report twice
        session.handle_link_event(link.id, LinkEvent::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_link_closed_reports_lost_once() {
        let (session, link, rx) = session_with_link(5);
        session.initialize().unwrap();
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Initialized { session_id: 5 });

        session.handle_link_event(link.id, LinkEvent::Closed);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::ConnectionLost);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!link.is_open());

        // A late DROP and a second close are both ignored
        session.handle_link_event(link.id, LinkEvent::Control(ControlMessage::Drop.encode()));
        session.handle_link_event(link.id, LinkEvent::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_superseded_link_ignored() {
        let (session, old, rx) = session_with_link(3);
        session.initialize().unwrap();
        let _ = rx.try_recv();

        let fresh = MockLink::new();
        session.set_link(fresh.clone());
        session.handle_link_event(old.id, LinkEvent::Closed);
        session.handle_link_event(old.id, LinkEvent::Data(Bytes::from_static(b"late")));
        assert!(rx.try_recv().is_err());

        session.initialize().unwrap();
        assert!(session.is_open());
    }

    #[test]
    fn test_close_sends_drop() {
        let (session, link, _rx) = session_with_link(3);
        session.initialize().unwrap();
        session.close();
        assert_eq!(link.sent_control.lock().last(), Some(&ControlMessage::Drop));
        assert!(!link.is_open());
        // Stopped sessions stay closed
        session.initialize().unwrap();
        assert!(!session.is_open());
    }

    #[test]
    fn test_malformed_control_closes_link() {
        let (session, link, _rx) = session_with_link(3);
        session.initialize().unwrap();
        session.handle_link_event(link.id, LinkEvent::Control(Bytes::from_static(&[0, 4])));
        assert!(!link.is_open());
    }
}
