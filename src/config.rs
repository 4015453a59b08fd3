//! Construction-time configuration
//!
//! Both executables read a TOML file; every field has a default so an empty
//! file (or no file at all) yields a working setup.

use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;
use crate::protocol::{ConnectionDescriptor, TransportKind};

/// Heartbeat send interval and inactivity window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub send_interval_ms: u64,
    pub inactivity_window_ms: u64,
}

impl HeartbeatConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn inactivity_window(&self) -> Duration {
        Duration::from_millis(self.inactivity_window_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            inactivity_window_ms: DEFAULT_INACTIVITY_WINDOW.as_millis() as u64,
        }
    }
}

/// Multicast subgroup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub join_timeout_ms: u64,
    pub rejoin_delay_ms: u64,
    pub multicast_port: u16,
    /// Deliver our own multicast datagrams back to us
    pub multicast_loopback: bool,
    /// Interface used to join the group; also the address this host is known by
    pub interface: Option<Ipv4Addr>,
}

impl MembershipConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn rejoin_delay(&self) -> Duration {
        Duration::from_millis(self.rejoin_delay_ms)
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: JOIN_TIMEOUT.as_millis() as u64,
            rejoin_delay_ms: REJOIN_DELAY.as_millis() as u64,
            multicast_port: MULTICAST_PORT,
            multicast_loopback: false,
            interface: None,
        }
    }
}

/// Client-side remote link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub ack_timeout_ms: u64,
    pub control_attempts: u32,
    pub connect_timeout_ms: u64,
    pub input_buffer_size: usize,
    pub output_buffer_size: usize,
}

impl LinkConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: CONTROL_ACK_TIMEOUT.as_millis() as u64,
            control_attempts: CONTROL_ATTEMPTS,
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            input_buffer_size: DEFAULT_BUFFER_SIZE,
            output_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Bridge client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Session identifier; must be positive
    pub session_id: i32,
    pub input_buffer_size: usize,
    pub output_buffer_size: usize,
    pub reconnect_delay_ms: u64,
    pub manager_grace_ms: u64,
    pub remote: ConnectionDescriptor,
    pub heartbeat: HeartbeatConfig,
    pub membership: MembershipConfig,
    pub link: LinkConfig,
}

impl BridgeConfig {
    pub const FILE_NAME: &'static str = "bridge.toml";

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn manager_grace(&self) -> Duration {
        Duration::from_millis(self.manager_grace_ms)
    }

    /// Link settings with the bridge-wide buffer sizes applied
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            input_buffer_size: self.input_buffer_size,
            output_buffer_size: self.output_buffer_size,
            ..self.link.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_id <= 0 {
            return Err(ConfigError::Invalid(format!(
                "session_id must be positive, got {}",
                self.session_id
            )));
        }
        validate_buffers(self.input_buffer_size, self.output_buffer_size)?;
        validate_heartbeat(&self.heartbeat)?;
        if self.link.control_attempts == 0 {
            return Err(ConfigError::Invalid("link.control_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        save_toml(self, path)
    }

    pub fn default_path() -> Option<PathBuf> {
        default_path(Self::FILE_NAME)
    }

    /// Load `path` if given, else the default location if present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match resolve(path, Self::FILE_NAME) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            session_id: 1,
            remote: ConnectionDescriptor::new(
                TransportKind::Udp,
                SocketAddr::from(([127, 0, 0, 1], DEFAULT_RELAY_PORT)),
            ),
            input_buffer_size: DEFAULT_BUFFER_SIZE,
            output_buffer_size: DEFAULT_BUFFER_SIZE,
            heartbeat: HeartbeatConfig::default(),
            membership: MembershipConfig::default(),
            link: LinkConfig::default(),
            reconnect_delay_ms: RECONNECT_DELAY.as_millis() as u64,
            manager_grace_ms: MANAGER_GRACE.as_millis() as u64,
        }
    }
}

/// One relay listening socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub protocol: TransportKind,
    pub bind: SocketAddr,
}

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub input_buffer_size: usize,
    pub output_buffer_size: usize,
    pub ack_timeout_ms: u64,
    /// Address of the HTTP status endpoint; disabled when absent
    pub status_bind: Option<SocketAddr>,
    pub heartbeat: HeartbeatConfig,
    pub listeners: Vec<ListenerConfig>,
}

impl RelayConfig {
    pub const FILE_NAME: &'static str = "relay.toml";

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::Invalid("at least one listener is required".into()));
        }
        validate_buffers(self.input_buffer_size, self.output_buffer_size)?;
        validate_heartbeat(&self.heartbeat)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        save_toml(self, path)
    }

    pub fn default_path() -> Option<PathBuf> {
        default_path(Self::FILE_NAME)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match resolve(path, Self::FILE_NAME) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let any = SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT));
        Self {
            listeners: vec![
                ListenerConfig { protocol: TransportKind::Udp, bind: any },
                ListenerConfig { protocol: TransportKind::Tcp, bind: any },
            ],
            input_buffer_size: DEFAULT_BUFFER_SIZE,
            output_buffer_size: DEFAULT_BUFFER_SIZE,
            heartbeat: HeartbeatConfig::default(),
            ack_timeout_ms: RELAY_ACK_TIMEOUT.as_millis() as u64,
            status_bind: None,
        }
    }
}

fn validate_buffers(input: usize, output: usize) -> Result<(), ConfigError> {
    // Room for the largest header (2-byte type + 8-byte packet id) inside a datagram
    const MAX: usize = u16::MAX as usize - 10;
    if input == 0 || output == 0 || input > MAX || output > MAX {
        return Err(ConfigError::Invalid(format!(
            "buffer sizes must be within 1..={MAX}, got input={input} output={output}"
        )));
    }
    Ok(())
}

fn validate_heartbeat(heartbeat: &HeartbeatConfig) -> Result<(), ConfigError> {
    if heartbeat.send_interval_ms == 0 || heartbeat.inactivity_window_ms == 0 {
        return Err(ConfigError::Invalid("heartbeat intervals must be non-zero".into()));
    }
    if heartbeat.send_interval_ms >= heartbeat.inactivity_window_ms {
        tracing::warn!(
            "heartbeat send interval {}ms is not shorter than the inactivity window {}ms",
            heartbeat.send_interval_ms,
            heartbeat.inactivity_window_ms
        );
    }
    Ok(())
}

fn default_path(file_name: &str) -> Option<PathBuf> {
    ProjectDirs::from("org", "lanbridge", "lanbridge").map(|dirs| dirs.config_dir().join(file_name))
}

fn resolve(path: Option<&Path>, file_name: &str) -> Option<PathBuf> {
    match path {
        Some(path) => Some(path.to_path_buf()),
        None => default_path(file_name).filter(|p| p.exists()),
    }
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    let text = toml::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.display().to_string(),
            source,
        })?;
    }
    std::fs::write(path, text).map_err(|source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_defaults() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat.send_interval(), Duration::from_secs(10));
        assert_eq!(config.heartbeat.inactivity_window(), Duration::from_secs(30));
        assert_eq!(config.membership.multicast_port, 5555);
        assert_eq!(config.link.control_attempts, 3);
        assert_eq!(config.input_buffer_size, 1024);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            session_id = 42

            [remote]
            protocol = "tcp"
            remote_address = "198.51.100.7:4000"

            [heartbeat]
            send_interval_ms = 2000
        "#;
        let config: BridgeConfig = toml::from_str(text).unwrap();
        assert_eq!(config.session_id, 42);
        assert_eq!(config.remote.protocol, TransportKind::Tcp);
        assert_eq!(config.heartbeat.send_interval_ms, 2000);
        assert_eq!(config.heartbeat.inactivity_window_ms, 30_000);
        assert_eq!(config.manager_grace_ms, 3000);
    }

    #[test]
    fn test_rejects_non_positive_session() {
        let config = BridgeConfig {
            session_id: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_link_config_takes_bridge_buffers() {
        let config = BridgeConfig {
            input_buffer_size: 4096,
            output_buffer_size: 2048,
            ..Default::default()
        };
        let link = config.link_config();
        assert_eq!(link.input_buffer_size, 4096);
        assert_eq!(link.output_buffer_size, 2048);
    }

    #[test]
    fn test_relay_save_and_load() {
        let dir = std::env::temp_dir().join(format!("lanbridge-config-{}", std::process::id()));
        let path = dir.join("relay.toml");
        let mut config = RelayConfig::default();
        config.status_bind = Some("127.0.0.1:8080".parse().unwrap());
        config.save(&path).unwrap();

        let loaded = RelayConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_relay_requires_listener() {
        let config = RelayConfig {
            listeners: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
