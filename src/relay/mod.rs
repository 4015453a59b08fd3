//! Session relay for members without direct connectivity

pub mod link;
pub mod server;
pub mod session;
pub mod status;

pub use server::{RelayEngine, RelayStats};
pub use session::{SessionSummary, SessionTable};
