//! Configuration loading and validation.
//!
//! ```toml
//! [node]
//! listen = "0.0.0.0:6966"
//! advertise = "203.0.113.7:6966"
//! transport = "udp"
//!
//! [overlay]
//! bootstrap = ["198.51.100.1:6966"]
//! heartbeat_secs = 5
//!
//! [log]
//! format = "json"
//! ```

use crate::overlay::Settings;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A single validation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("overlay.heartbeat_secs must be at least 1")]
    ZeroHeartbeat,
    #[error("overlay.dedup_capacity must be at least 1")]
    ZeroDedupCapacity,
    #[error("overlay.address_memory must be at least 1")]
    ZeroAddressMemory,
    #[error("node.advertise is required with the tcp transport")]
    TcpWithoutAdvertise,
    #[error("node.advertise must not be an unspecified address, got {0}")]
    UnspecifiedAdvertise(SocketAddr),
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Local endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Address to bind.
    pub listen: SocketAddr,
    /// Address other nodes should reply to, when `listen` is not reachable
    /// as-is (wildcard binds, NAT, stream transports).
    #[serde(default)]
    pub advertise: Option<SocketAddr>,
    #[serde(default)]
    pub transport: TransportKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
}

/// Overlay tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    /// Members to ask for a coordinate. Empty means found a new lace.
    #[serde(default)]
    pub bootstrap: Vec<SocketAddr>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_address_memory")]
    pub address_memory: usize,
    #[serde(default = "default_max_missed_pings")]
    pub max_missed_pings: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            heartbeat_secs: default_heartbeat_secs(),
            dedup_capacity: default_dedup_capacity(),
            address_memory: default_address_memory(),
            max_missed_pings: default_max_missed_pings(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

pub fn default_heartbeat_secs() -> u64 {
    5
}

pub fn default_dedup_capacity() -> usize {
    2500
}

pub fn default_address_memory() -> usize {
    50
}

pub fn default_max_missed_pings() -> u32 {
    5
}

impl Config {
    /// Load and validate a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Check the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.overlay.heartbeat_secs == 0 {
            errors.push(ValidationError::ZeroHeartbeat);
        }
        if self.overlay.dedup_capacity == 0 {
            errors.push(ValidationError::ZeroDedupCapacity);
        }
        if self.overlay.address_memory == 0 {
            errors.push(ValidationError::ZeroAddressMemory);
        }

        match self.node.advertise {
            None if self.node.transport == TransportKind::Tcp => {
                errors.push(ValidationError::TcpWithoutAdvertise);
            }
            Some(addr) if addr.ip().is_unspecified() => {
                errors.push(ValidationError::UnspecifiedAdvertise(addr));
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.overlay.heartbeat_secs)
    }

    /// Overlay settings for a node built from this configuration.
    pub fn settings(&self) -> Settings {
        Settings {
            dedup_capacity: self.overlay.dedup_capacity,
            address_memory: self.overlay.address_memory,
            max_missed_pings: self.overlay.max_missed_pings,
            bootstrap: self.overlay.bootstrap.clone(),
            advertise: self.node.advertise,
        }
    }
}
