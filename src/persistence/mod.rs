//! # Persistence Module
//!
//! Durable storage of the last broker configuration, so a later `reconnect()` (or a
//! restart of the binary) can reach the same broker without asking for it again.
//!
//! The engine only sees the [`ConfigStore`] capability. Stores swallow their own
//! failures: a store that cannot be read behaves like one that holds nothing, and a
//! failed save is logged and otherwise ignored.

pub mod config_store;

use crate::mqtt::config::BrokerConfig;

pub use config_store::{MemoryConfigStore, TomlConfigStore};

/// Fixed key the broker configuration is stored under.
pub const CONFIG_KEY: &str = "mqtt_config";

/// Load/save capability injected into the MQTT engine.
pub trait ConfigStore: Send + Sync + 'static {
    /// The saved configuration, or `None` when nothing usable is stored.
    fn load_config(&self) -> Option<BrokerConfig>;

    fn save_config(&self, config: &BrokerConfig);
}
