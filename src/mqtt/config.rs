use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::candidates::Scheme;
use super::error::MqttError;

/// Broker endpoint and credentials of one connection.
///
/// Replaced wholesale on every successful `connect`; never mutated in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_scheme: Option<Scheme>,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("forced_scheme", &self.forced_scheme)
            .finish()
    }
}

/// Options that shape candidate probing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub forced_scheme: Option<Scheme>,
}

/// Arguments of a `connect` call.
///
/// ```rust
/// use wsmqtt::{ConnectRequest, Scheme};
///
/// let request = ConnectRequest::new("broker.local", 9001)
///     .client_id("kitchen-panel")
///     .credentials("user", "secret")
///     .forced_scheme(Scheme::Wss);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub options: ConnectOptions,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: None,
            username: None,
            password: None,
            options: ConnectOptions::default(),
        }
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn forced_scheme(mut self, scheme: Scheme) -> Self {
        self.options.forced_scheme = Some(scheme);
        self
    }

    /// Validates the request and fills in a generated client id when none was given.
    pub fn into_config(self) -> Result<BrokerConfig, MqttError> {
        let host = self.host.trim().to_string();
        if host.is_empty() {
            return Err(MqttError::InvalidConfig("broker host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(MqttError::InvalidConfig("broker port is 0".to_string()));
        }

        let client_id = self
            .client_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_client_id);

        Ok(BrokerConfig {
            host,
            port: self.port,
            client_id,
            username: self.username,
            password: self.password,
            forced_scheme: self.options.forced_scheme,
        })
    }
}

impl From<&BrokerConfig> for ConnectRequest {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: Some(config.client_id.clone()),
            username: config.username.clone(),
            password: config.password.clone(),
            options: ConnectOptions {
                forced_scheme: config.forced_scheme,
            },
        }
    }
}

/// `mqtt_client_` followed by 8 hex digits.
pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("mqtt_client_{}", &id[..8])
}
