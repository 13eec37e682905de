//! Bridge configuration
//!
//! TOML-backed configuration for the daemon. Every field has a default, so
//! an absent file means "real device, well-known port".

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Address the TCP listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Well-known bridge port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of simultaneous client connections.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Receive buffer for device batches. The device hands over large
    /// accumulated batches in one read, hence the size.
    #[serde(default = "default_recv_buffer_len")]
    pub recv_buffer_len: usize,
    /// Transport selection.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Streaming buffering watermarks applied after negotiation.
    #[serde(default)]
    pub buffering: BufferingConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            max_clients: default_max_clients(),
            recv_buffer_len: default_recv_buffer_len(),
            transport: TransportConfig::default(),
            buffering: BufferingConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// The real diagnostics character device (Linux only).
    Chardev(ChardevConfig),
    /// In-memory mock transport for testing.
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Chardev(ChardevConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChardevConfig {
    /// Device node path.
    #[serde(default = "default_device_path")]
    pub path: String,
}

impl Default for ChardevConfig {
    fn default() -> Self {
        Self {
            path: default_device_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Whether the fake device reports remote peripheral routing.
    #[serde(default)]
    pub remote_variant: bool,
}

/// Watermarks for the device's streaming buffering mode, in percent of the
/// peripheral buffer. Applied best-effort after negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferingConfig {
    #[serde(default = "default_low_watermark")]
    pub low_watermark: u8,
    #[serde(default = "default_high_watermark")]
    pub high_watermark: u8,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    43555
}

fn default_max_clients() -> usize {
    4096
}

fn default_recv_buffer_len() -> usize {
    10 * 1024 * 1024
}

fn default_device_path() -> String {
    "/dev/diag".to_string()
}

fn default_low_watermark() -> u8 {
    15
}

fn default_high_watermark() -> u8 {
    85
}
