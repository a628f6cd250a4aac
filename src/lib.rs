//! MQTT 3.1.1 client over WebSocket.
//!
//! ```no_run
//! use wsmqtt::{ConnectRequest, MqttHandle, QoS};
//!
//! # async fn run() -> Result<(), wsmqtt::MqttError> {
//! let client = MqttHandle::with_defaults();
//! client.add_message_listener(|msg| println!("{}", msg));
//! client.connect(ConnectRequest::new("broker.local", 9001)).await?;
//! client.subscribe("sensors/#", QoS::AtMostOnce).await?;
//! client.publish("sensors/hello", "hi", QoS::AtLeastOnce).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod mqtt;
pub mod persistence;

pub use config::ClientSettings;
pub use mqtt::{
    BrokerConfig, ConnectOptions, ConnectRequest, ConnectReturnCode, ConnectionCandidate,
    ConnectionState, ListenerId, MqttError, MqttHandle, MqttMessage, MqttStatus, QoS, Scheme,
};
pub use persistence::{ConfigStore, MemoryConfigStore, TomlConfigStore};
