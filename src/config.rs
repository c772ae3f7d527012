//! Application configuration
//!
//! Configuration is read from a TOML file. Every field has a default, so a
//! partial file (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::Role;

/// Top-level configuration shared by both binaries
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub relay: RelayConfig,
    pub talker: TalkerConfig,
}

/// Channel relay server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket listener binds to
    pub bind_address: String,
    /// Listener port (the `PORT` environment variable wins when set)
    pub port: u16,
    /// Path of the WebSocket endpoint
    pub ws_path: String,
    /// Largest accepted inbound message in bytes
    pub max_message_size: usize,
    /// Outbound messages queued per peer before relayed traffic is dropped
    pub outbound_queue: usize,
    /// Optional directory served as the web front-end
    pub static_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            ws_path: "/ws".to_string(),
            max_message_size: 64 * 1024,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            static_dir: None,
        }
    }
}

impl RelayConfig {
    /// `bind_address:port` as a listener address string
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Participant (talker) settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TalkerConfig {
    /// WebSocket URL of the relay
    pub server_url: String,
    /// Channel to join
    pub channel: u8,
    /// Role announced on join
    pub role: Role,
    /// Input device id (`input:<name>`); host default when unset
    pub input_device: Option<String>,
    /// Output device id (`output:<name>`); host default when unset
    pub output_device: Option<String>,
    /// Audio buffered before playback starts
    pub prebuffer_ms: u32,
    /// Jitter buffer capacity
    pub buffer_seconds: u32,
    /// How long to wait for the relay's `joined` reply
    pub join_timeout_ms: u64,
}

impl Default for TalkerConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{}/ws", DEFAULT_PORT),
            channel: 1,
            role: Role::Client,
            input_device: None,
            output_device: None,
            prebuffer_ms: DEFAULT_PREBUFFER_MS,
            buffer_seconds: DEFAULT_BUFFER_SECONDS,
            join_timeout_ms: 5000,
        }
    }
}

impl TalkerConfig {
    /// Jitter buffer capacity in transport-rate samples
    pub fn buffer_capacity(&self) -> usize {
        (TRANSPORT_SAMPLE_RATE * self.buffer_seconds.max(1)) as usize
    }

    /// Pre-buffer threshold in transport-rate samples, never above capacity
    pub fn prebuffer_samples(&self) -> usize {
        let samples = (TRANSPORT_SAMPLE_RATE as u64 * self.prebuffer_ms as u64 / 1000) as usize;
        samples.clamp(1, self.buffer_capacity())
    }
}

impl AppConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the platform config
    /// directory is tried and defaults are used when nothing is there.
    /// The `PORT` environment variable overrides `relay.port` either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        if let Ok(port) = std::env::var("PORT") {
            config.relay.port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid PORT value: {}", port)))?;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Self::from_toml(&text)
    }
}

/// `<config dir>/ptt-radio/config.toml` for the current platform
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "ptt-radio")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
