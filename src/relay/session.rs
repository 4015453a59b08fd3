//! Session fan-out
//!
//! Every link that completed its handshake with a positive session id is a
//! member of that session. A payload from one member goes, unmodified, to
//! every other member whose session is open and enabled.

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::remote::link::LinkId;
use crate::remote::session::RemoteSession;

/// Members of one session id
#[derive(Default)]
pub struct RelaySession {
    members: Vec<(LinkId, Arc<RemoteSession>)>,
}

impl RelaySession {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn targets(&self, from: LinkId) -> Vec<Arc<RemoteSession>> {
        self.members
            .iter()
            .filter(|(id, session)| *id != from && session.is_open() && session.is_enabled())
            .map(|(_, session)| session.clone())
            .collect()
    }
}

/// Per-session member counts for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: i32,
    pub members: usize,
}

/// All relay sessions, shared by every listener of an engine
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<i32, RelaySession>,
    forwarded: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, session_id: i32, id: LinkId, session: Arc<RemoteSession>) {
        let mut entry = self.sessions.entry(session_id).or_default();
        if !entry.members.iter().any(|(member, _)| *member == id) {
            entry.members.push((id, session));
            tracing::info!("Link {} joined session {} ({} members)", id, session_id, entry.len());
        }
    }

    /// Remove a member; the session goes away with its last member
    pub fn leave(&self, session_id: i32, id: LinkId) -> bool {
        let removed = match self.sessions.get_mut(&session_id) {
            Some(mut entry) => {
                let before = entry.members.len();
                entry.members.retain(|(member, _)| *member != id);
                before != entry.members.len()
            }
            None => false,
        };
        self.sessions.remove_if(&session_id, |_, session| session.is_empty());
        if removed {
            tracing::info!("Link {} left session {}", id, session_id);
        }
        removed
    }

    /// Send `payload` to every other open, enabled member. Returns how many
    /// members it went to.
    pub fn forward(&self, session_id: i32, from: LinkId, payload: &Bytes) -> usize {
        // Collected first so no shard lock is held while sending
        let targets = match self.sessions.get(&session_id) {
            Some(session) => session.targets(from),
            None => return 0,
        };

        let mut delivered = 0;
        for target in targets {
            match target.send_data(payload) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Forward in session {} failed: {}", session_id, e),
            }
        }
        self.forwarded.fetch_add(delivered as u64, Ordering::Relaxed);
        tracing::trace!("{} bytes from {} to {} members of session {}", payload.len(), from, delivered, session_id);
        delivered
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn member_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.len()).sum()
    }

    /// Payload copies delivered so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn summary(&self, session_id: i32) -> Option<SessionSummary> {
        self.sessions.get(&session_id).map(|session| SessionSummary {
            session_id,
            members: session.len(),
        })
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                session_id: *entry.key(),
                members: entry.len(),
            })
            .collect();
        summaries.sort_by_key(|s| s.session_id);
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::link::{LinkEvent, RemoteLink};
    use crate::remote::session::tests::MockLink;
    use crate::remote::session::{ControlMessage, SessionEvent};

    /// Relay-side member: the peer initialized and enabled the session
    fn member(session_id: i32, enabled: bool) -> (Arc<RemoteSession>, Arc<MockLink>) {
        let session = RemoteSession::new(0, Arc::new(|_: SessionEvent| {}));
        let link = MockLink::new();
        link.open().unwrap();
        session.set_link(link.clone());
        session.handle_link_event(
            link.id,
            LinkEvent::Control(ControlMessage::Initialize { session_id }.encode()),
        );
        session.handle_link_event(link.id, LinkEvent::Control(ControlMessage::Enable(enabled).encode()));
        (session, link)
    }

    #[test]
    fn test_fan_out_skips_sender() {
        let table = SessionTable::new();
        let links: Vec<_> = (0..3).map(|_| member(7, true)).collect();
        for (session, link) in &links {
            table.join(7, link.id, session.clone());
        }

        let payload = Bytes::from_static(b"hello");
        assert_eq!(table.forward(7, links[1].1.id, &payload), 2);

        assert_eq!(*links[0].1.sent_data.lock(), vec![payload.clone()]);
        assert!(links[1].1.sent_data.lock().is_empty());
        assert_eq!(*links[2].1.sent_data.lock(), vec![payload]);
        assert_eq!(table.forwarded(), 2);
    }

    #[test]
    fn test_disabled_members_and_other_sessions_skipped() {
        let table = SessionTable::new();
        let (sender, sender_link) = member(7, true);
        let (disabled, disabled_link) = member(7, false);
        let (other, other_link) = member(8, true);
        table.join(7, sender_link.id, sender);
        table.join(7, disabled_link.id, disabled);
        table.join(8, other_link.id, other);

        assert_eq!(table.forward(7, sender_link.id, &Bytes::from_static(b"x")), 0);
        assert!(disabled_link.sent_data.lock().is_empty());
        assert!(other_link.sent_data.lock().is_empty());
        assert_eq!(table.forward(99, sender_link.id, &Bytes::from_static(b"x")), 0);
    }

    #[test]
    fn test_leave_removes_empty_session() {
        let table = SessionTable::new();
        let (a, a_link) = member(5, true);
        let (b, b_link) = member(5, true);
        table.join(5, a_link.id, a.clone());
        table.join(5, a_link.id, a);
        table.join(5, b_link.id, b);
        assert_eq!(table.member_count(), 2);

        assert!(table.leave(5, a_link.id));
        assert!(!table.leave(5, a_link.id));
        assert_eq!(table.summaries(), vec![SessionSummary { session_id: 5, members: 1 }]);

        assert!(table.leave(5, b_link.id));
        assert_eq!(table.session_count(), 0);
    }
}
