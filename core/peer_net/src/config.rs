//! Network settings
//!
//! Settings come from the host as a JSON object (or a JSON file on disk).
//! Every key is optional; missing keys take the defaults below.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::framing::DEFAULT_MAX_FRAME_LEN;

// ============================================================================
// Defaults
// ============================================================================

/// Seconds between discovery announcements
pub const DEFAULT_BROADCAST_TIME: u64 = 30;

pub const DEFAULT_DISCOVERY_GROUP: &str = "224.1.1.1";

pub const DEFAULT_DISCOVERY_PORT: u16 = 4377;

/// Multicast TTL; 1 keeps announcements on the local segment
pub const DEFAULT_DISCOVERY_TTL: u32 = 1;

pub const DEFAULT_STREAM_PORT: u16 = 4377;

/// Readiness poll timeout, also the stop-flag check interval
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// How long shutdown waits for the I/O thread before proceeding
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 250;

// ============================================================================
// Settings Provider
// ============================================================================

/// Source of settings values by key, supplied by the host environment.
pub trait SettingsProvider {
    fn setting(&self, key: &str) -> Option<Value>;
}

impl SettingsProvider for Map<String, Value> {
    fn setting(&self, key: &str) -> Option<Value> {
        self.get(key).cloned()
    }
}

// ============================================================================
// NetConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Seconds between discovery announcements
    pub broadcast_time: u64,
    /// Multicast group joined for discovery
    pub discovery_group: String,
    pub discovery_port: u16,
    pub discovery_ttl: u32,
    /// Listen address; empty binds every interface and advertises the
    /// address of the default route
    pub stream_ip: String,
    pub stream_port: u16,
    /// Carried in the Introduction, never verified
    pub user: String,
    pub password: String,
    /// Advertised host name; empty uses the system host name
    pub hostname: String,
    pub discovery_enabled: bool,
    pub poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Largest frame accepted from a peer
    pub max_frame_len: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            broadcast_time: DEFAULT_BROADCAST_TIME,
            discovery_group: DEFAULT_DISCOVERY_GROUP.to_string(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_ttl: DEFAULT_DISCOVERY_TTL,
            stream_ip: String::new(),
            stream_port: DEFAULT_STREAM_PORT,
            user: String::new(),
            password: String::new(),
            hostname: String::new(),
            discovery_enabled: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl NetConfig {
    /// Every key this config reads from a [`SettingsProvider`]
    pub const KEYS: [&'static str; 13] = [
        "broadcast_time",
        "discovery_group",
        "discovery_port",
        "discovery_ttl",
        "stream_ip",
        "stream_port",
        "user",
        "password",
        "hostname",
        "discovery_enabled",
        "poll_interval_ms",
        "shutdown_grace_ms",
        "max_frame_len",
    ];

    /// Build a config from the known keys of `provider`, then validate it.
    pub fn from_settings(provider: &dyn SettingsProvider) -> Result<Self, ConfigError> {
        let mut object = Map::new();
        for key in Self::KEYS {
            if let Some(value) = provider.setting(key) {
                object.insert(key.to_string(), value);
            }
        }
        let config: NetConfig = serde_json::from_value(Value::Object(object))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        let object: Map<String, Value> = serde_json::from_str(&text)?;
        Self::from_settings(&object)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let group = self.discovery_group_ip()?;
        if !group.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "discovery_group {} is not a multicast address",
                group
            )));
        }
        if self.discovery_ttl > 255 {
            return Err(ConfigError::Invalid(format!(
                "discovery_ttl {} is out of range (0-255)",
                self.discovery_ttl
            )));
        }
        self.stream_ip_addr()?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Parsed multicast group
    pub fn discovery_group_ip(&self) -> Result<Ipv4Addr, ConfigError> {
        self.discovery_group.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "discovery_group '{}' is not an IPv4 address",
                self.discovery_group
            ))
        })
    }

    /// Listen IP, or `None` to bind every interface
    pub fn stream_ip_addr(&self) -> Result<Option<Ipv4Addr>, ConfigError> {
        if self.stream_ip.is_empty() {
            return Ok(None);
        }
        self.stream_ip.parse().map(Some).map_err(|_| {
            ConfigError::Invalid(format!(
                "stream_ip '{}' is not an IPv4 address",
                self.stream_ip
            ))
        })
    }

    /// Multicast destination for discovery announcements
    pub fn discovery_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::V4(SocketAddrV4::new(
            self.discovery_group_ip()?,
            self.discovery_port,
        )))
    }

    /// Address the TCP listener binds
    pub fn stream_bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self.stream_ip_addr()?.unwrap_or(Ipv4Addr::UNSPECIFIED);
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.stream_port)))
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_time)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
