//! LAN side: multicast subgroup channel and membership

pub mod channel;
pub mod membership;
pub mod wire;

pub use channel::{ChannelEvent, MulticastChannel};
pub use membership::{GroupMembership, LocalPeer, MembershipEvent, MembershipSink, MembershipState};
