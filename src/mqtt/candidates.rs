//! Connection candidate generation
//!
//! Brokers expose MQTT-over-WebSocket on paths that are not standardized. Instead of
//! asking the user for the exact endpoint, the client probes an ordered list of
//! (scheme, path) combinations chosen from the port number or a forced scheme.

use serde::{Deserialize, Serialize};
use std::fmt;

/// WebSocket URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (scheme, path) combination to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCandidate {
    pub scheme: Scheme,
    pub path: &'static str,
}

impl ConnectionCandidate {
    const fn new(scheme: Scheme, path: &'static str) -> Self {
        Self { scheme, path }
    }

    pub fn url(&self, host: &str, port: u16) -> String {
        format!("{}://{}:{}{}", self.scheme, host, port, self.path)
    }

    /// A secure socket without a path is known to fail fast.
    pub fn is_fast_fail(&self) -> bool {
        self.scheme == Scheme::Wss && self.path.is_empty()
    }
}

impl fmt::Display for ConnectionCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { self.path };
        write!(f, "{}{}", self.scheme, path)
    }
}

const FORCED_PATHS: [&str; 4] = ["/mqtt", "/ws", "/websocket", ""];

/// Ports commonly serving MQTT over secure WebSocket.
const SECURE_LIKELY_PORTS: [u16; 3] = [8083, 9001, 443];

/// Plain TCP MQTT ports, where WebSocket is unlikely but still attempted.
const TCP_MQTT_PORTS: [u16; 2] = [1883, 8883];

/// Produces the ordered probe list for `port`, optionally pinned to one scheme.
pub fn generate(port: u16, forced_scheme: Option<Scheme>) -> Vec<ConnectionCandidate> {
    use Scheme::{Ws, Wss};

    if let Some(scheme) = forced_scheme {
        return FORCED_PATHS
            .iter()
            .map(|&path| ConnectionCandidate::new(scheme, path))
            .filter(|candidate| !candidate.is_fast_fail())
            .collect();
    }

    if SECURE_LIKELY_PORTS.contains(&port) {
        vec![
            ConnectionCandidate::new(Wss, "/mqtt"),
            ConnectionCandidate::new(Wss, "/ws"),
            ConnectionCandidate::new(Wss, "/websocket"),
            ConnectionCandidate::new(Ws, "/mqtt"),
            ConnectionCandidate::new(Ws, "/ws"),
        ]
    } else if TCP_MQTT_PORTS.contains(&port) {
        vec![
            ConnectionCandidate::new(Ws, "/mqtt"),
            ConnectionCandidate::new(Ws, ""),
            ConnectionCandidate::new(Ws, "/ws"),
        ]
    } else {
        vec![
            ConnectionCandidate::new(Ws, "/mqtt"),
            ConnectionCandidate::new(Ws, "/ws"),
            ConnectionCandidate::new(Ws, "/websocket"),
            ConnectionCandidate::new(Ws, ""),
        ]
    }
}
