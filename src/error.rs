//! Error types for the bridge and relay

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote link errors (transport and framing)
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link is not open")]
    NotOpen,

    #[error("Link closed")]
    Closed,

    #[error("No acknowledgement after {attempts} attempts")]
    AckTimeout { attempts: u32 },

    #[error("Declared frame length {declared} exceeds {max}")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u16),

    #[error("Malformed message: {0}")]
    Malformed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Whether the error is a protocol violation (fatal to the link only)
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            LinkError::FrameTooLarge { .. }
                | LinkError::UnknownMessageType(_)
                | LinkError::Malformed(_)
        )
    }
}

/// Multicast membership errors
#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("Invalid session identifier: {0}")]
    InvalidSessionId(i32),

    #[error("Membership is not ready")]
    NotReady,

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
