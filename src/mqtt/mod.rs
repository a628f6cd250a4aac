//! # MQTT over WebSocket
//!
//! A self-contained MQTT 3.1.1 client. Packets are built and parsed by hand; the
//! only external protocol layer is the WebSocket transport underneath.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── codec.rs            - length-prefixed strings and the remaining-length varint
//! ├── packet.rs           - control packet builders/decoders, packet ids, frame reassembly
//! ├── candidates.rs       - ordered (scheme, path) candidates for a broker port
//! ├── transport.rs        - Transport/Link boundary and the tokio-tungstenite implementation
//! ├── timers.rs           - cancellable, sequence-guarded engine timers
//! ├── attempt.rs          - per-candidate probe state machine
//! ├── mqtt_handler.rs     - connection manager engine and the public MqttHandle
//! ├── message_manager.rs  - message listeners and the error slot
//! ├── config.rs           - BrokerConfig and ConnectRequest
//! └── error.rs            - error types and CONNACK return codes
//! ```
//!
//! ## Connecting
//!
//! Brokers expose MQTT over WebSocket on inconsistent paths, so `connect` walks a
//! list of candidate URLs derived from the port (see [`candidates::generate`]) and
//! keeps the first one whose broker answers CONNECT with an accepted CONNACK.
//! A session that drops unexpectedly is re-established automatically a bounded
//! number of times, after which the error listener is told once.

pub(crate) mod attempt;
pub mod candidates;
pub mod codec;
pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod packet;
pub(crate) mod timers;
pub mod transport;

pub use candidates::{ConnectionCandidate, Scheme};
pub use config::{BrokerConfig, ConnectOptions, ConnectRequest};
pub use error::{ConnectReturnCode, DecodeError, EncodeError, MqttError};
pub use message_manager::{ListenerId, MessageManager, MqttMessage};
pub use mqtt_handler::{ConnectionState, MqttHandle, MqttStatus};
pub use packet::QoS;
pub use transport::{
    EventSink, Link, LinkId, ReadyState, SharedReadyState, Transport, TransportError,
    TransportEvent, WebSocketTransport,
};
