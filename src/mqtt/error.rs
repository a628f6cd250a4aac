//! Error types for the MQTT-over-WebSocket client
//!
//! Errors fall into four groups:
//! - **Encoding**: a string or packet does not fit the wire format. Rejected before sending.
//! - **Transport**: open failure, timeout or unexpected close. Recovered locally by the
//!   attempt runner or the reconnect logic and only surfaced in aggregate.
//! - **Protocol rejection**: a nonzero CONNACK return code.
//! - **Operational**: using the client while it is not connected.

use std::fmt;

/// Failure to put a value on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("String of {len} bytes exceeds the 65535 byte limit")]
    StringTooLong { len: usize },

    #[error("Remaining length {0} exceeds the 268435455 byte limit")]
    RemainingLengthTooLarge(usize),
}

/// Failure to read a value from the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Not enough data")]
    Incomplete,

    #[error("Remaining length uses more than 4 bytes")]
    MalformedRemainingLength,

    #[error("String is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("Packet of {size} bytes exceeds the {limit} byte limit")]
    PacketTooLarge { size: usize, limit: usize },
}

/// CONNACK return codes of MQTT 3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
    /// Any value outside 0..=5.
    Unknown(u8),
}

impl ConnectReturnCode {
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

impl From<u8> for ConnectReturnCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "connection accepted"),
            Self::UnacceptableProtocolVersion => write!(f, "unacceptable protocol version"),
            Self::IdentifierRejected => write!(f, "client identifier rejected"),
            Self::ServerUnavailable => write!(f, "server unavailable"),
            Self::BadUserNameOrPassword => write!(f, "bad user name or password"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::Unknown(code) => write!(f, "unknown rejection (code {})", code),
        }
    }
}

/// Errors returned by the client API.
///
/// `Clone` because a single in-flight connect outcome is handed to every caller
/// that joined it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MqttError {
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),

    #[error("MQTT client is not connected")]
    NotConnected,

    #[error("Broker refused the connection: {0}")]
    ConnectionRefused(ConnectReturnCode),

    /// Every connection candidate failed.
    #[error("Could not connect after {attempts} attempts: {reason}")]
    ConnectFailed { attempts: usize, reason: String },

    #[error("Connection to the broker was lost")]
    ConnectionLost,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No broker configuration available")]
    NoBrokerConfig,

    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(String),

    #[error("QoS {0} is not supported")]
    UnsupportedQos(u8),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("MQTT engine is no longer running")]
    EngineStopped,
}
