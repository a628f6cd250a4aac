//! Client timing and limits
//!
//! Every delay the engine uses lives here so deployments can tune them from a TOML
//! file. Missing keys fall back to the defaults below.

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientSettings {
    /// Keep-alive announced to the broker in CONNECT
    pub keep_alive_secs: u16,
    /// Interval between PINGREQs while connected
    pub ping_interval_ms: u64,
    /// Pause between transport open and sending CONNECT
    pub settle_delay_ms: u64,
    /// Timeout of the first candidate of a probe run
    pub first_attempt_timeout_ms: u64,
    /// Timeout of every later candidate
    pub attempt_timeout_ms: u64,
    /// Timeout of `wss` candidates without a path
    pub fast_fail_timeout_ms: u64,
    /// Pause after a failed candidate before opening the next one
    pub attempt_debounce_ms: u64,
    /// Delay before each automatic reconnect
    pub reconnect_delay_ms: u64,
    /// Automatic reconnects per broker config before giving up
    pub max_reconnect_attempts: u32,
    /// How long a QoS 1 publish waits for PUBACK before resolving anyway
    pub publish_grace_ms: u64,
    /// Stop probing on the first CONNACK rejection instead of trying further candidates
    pub abort_on_rejection: bool,
    /// Capacity of the API action queue
    pub action_buffer: usize,
    /// Largest inbound packet accepted; a longer announced length drops the link
    pub max_packet_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: 60,
            ping_interval_ms: 30_000,
            settle_delay_ms: 100,
            first_attempt_timeout_ms: 5_000,
            attempt_timeout_ms: 3_000,
            fast_fail_timeout_ms: 1_000,
            attempt_debounce_ms: 200,
            reconnect_delay_ms: 3_000,
            max_reconnect_attempts: 3,
            publish_grace_ms: 5_000,
            abort_on_rejection: false,
            action_buffer: 32,
            max_packet_size: 1024 * 1024,
        }
    }
}

impl ClientSettings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse client settings: {}", e))
    }

    /// Loads settings from `path`, using defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre!("Failed to read settings file {}: {}", path.display(), e))?;
        let settings = Self::from_toml_str(&content)?;
        if settings.max_reconnect_attempts == 0 {
            warn!("Automatic reconnection is disabled (max_reconnect_attempts = 0)");
        }
        Ok(settings)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn attempt_debounce(&self) -> Duration {
        Duration::from_millis(self.attempt_debounce_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn publish_grace(&self) -> Duration {
        Duration::from_millis(self.publish_grace_ms)
    }
}
