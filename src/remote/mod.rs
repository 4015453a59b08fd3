//! WAN side: unicast links and the session handshake on top of them

pub mod frame;
pub mod history;
pub mod link;
pub mod session;
pub mod tcp;
pub mod udp;

pub use link::{connect, LinkEvent, LinkId, LinkSink, LinkStats, RemoteLink};
pub use session::{RemoteSession, SessionEvent, SessionSink, SessionState};
