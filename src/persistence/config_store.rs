use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::{ConfigStore, CONFIG_KEY};
use crate::mqtt::config::BrokerConfig;

const CONFIG_DIR: &str = ".config/wsmqtt";
const CONFIG_FILE: &str = "mqtt_config.toml";

#[derive(Deserialize, Serialize)]
struct StoredConfig {
    mqtt_config: BrokerConfig,
}

/// Keeps the broker configuration in a TOML file.
#[derive(Debug, Clone)]
pub struct TomlConfigStore {
    path: PathBuf,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<home>/.config/wsmqtt/mqtt_config.toml`
    pub fn default_location() -> Self {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<BrokerConfig>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| eyre!("Failed to read {}: {}", self.path.display(), e))?;
        let stored: StoredConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse {} entry: {}", CONFIG_KEY, e))?;
        Ok(Some(stored.mqtt_config))
    }

    fn write(&self, config: &BrokerConfig) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let stored = StoredConfig {
            mqtt_config: config.clone(),
        };
        let content = toml::to_string(&stored)
            .map_err(|e| eyre!("Failed to serialize {}: {}", CONFIG_KEY, e))?;
        std::fs::write(&self.path, content)
            .map_err(|e| eyre!("Failed to write {}: {}", self.path.display(), e))?;
        Ok(())
    }
}

impl ConfigStore for TomlConfigStore {
    fn load_config(&self) -> Option<BrokerConfig> {
        match self.read() {
            Ok(Some(config)) => {
                debug!("Loaded broker config for {}:{}", config.host, config.port);
                Some(config)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring saved broker config: {}", e);
                None
            }
        }
    }

    fn save_config(&self, config: &BrokerConfig) {
        match self.write(config) {
            Ok(()) => info!("Saved broker config to {}", self.path.display()),
            Err(e) => warn!("Could not save broker config: {}", e),
        }
    }
}

/// In-memory store, for embedding without a filesystem and for tests.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<Option<BrokerConfig>>,
}

impl MemoryConfigStore {
    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            config: Mutex::new(Some(config)),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_config(&self) -> Option<BrokerConfig> {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save_config(&self, config: &BrokerConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Home directory not found, storing config relative to the working directory");
        PathBuf::from(".")
    })
}
