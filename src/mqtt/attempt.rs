//! Transport attempt runner
//!
//! Walks the candidate list of one connect cycle, one candidate at a time:
//!
//! ```text
//! Idle ──► Opening ──► AwaitingConnAck ──► Accepted
//!             │               │
//!             │               ├──► Rejected ───────┐
//!             ├──► TimedOut ──┤                    ├──► next candidate / exhausted
//!             └──► TransportError ◄────────────────┘
//! ```
//!
//! The runner holds no I/O. The engine opens links, arms timers and feeds the
//! outcomes back; the runner decides timeouts, records failures and builds the
//! aggregate error once every candidate failed.

use std::time::Duration;

use super::candidates::{self, ConnectionCandidate};
use super::config::BrokerConfig;
use super::error::{ConnectReturnCode, MqttError};
use crate::config::ClientSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptPhase {
    Idle,
    Opening,
    AwaitingConnAck,
    Accepted,
    Rejected,
    TimedOut,
    TransportError,
}

/// Why a single candidate did not produce a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CandidateFailure {
    TimedOut,
    Transport(String),
    Closed(Option<u16>),
    Rejected(ConnectReturnCode),
}

pub(crate) struct AttemptRunner {
    config: BrokerConfig,
    candidates: Vec<ConnectionCandidate>,
    index: usize,
    phase: AttemptPhase,
    attempts: usize,
    last_failure: Option<CandidateFailure>,
    rejection: Option<ConnectReturnCode>,
    is_reconnect: bool,
}

impl AttemptRunner {
    pub fn new(config: BrokerConfig, is_reconnect: bool) -> Self {
        let candidates = candidates::generate(config.port, config.forced_scheme);
        Self {
            config,
            candidates,
            index: 0,
            phase: AttemptPhase::Idle,
            attempts: 0,
            last_failure: None,
            rejection: None,
            is_reconnect,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn into_config(self) -> BrokerConfig {
        self.config
    }

    pub fn is_reconnect(&self) -> bool {
        self.is_reconnect
    }

    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    pub fn current(&self) -> Option<&ConnectionCandidate> {
        self.candidates.get(self.index)
    }

    pub fn current_url(&self) -> Option<String> {
        self.current()
            .map(|candidate| candidate.url(&self.config.host, self.config.port))
    }

    /// Moves the current candidate into `Opening` and returns its timeout.
    pub fn begin(&mut self, settings: &ClientSettings) -> Option<Duration> {
        let candidate = self.current()?;
        let timeout_ms = if candidate.is_fast_fail() {
            settings.fast_fail_timeout_ms
        } else if self.index == 0 {
            settings.first_attempt_timeout_ms
        } else {
            settings.attempt_timeout_ms
        };
        self.phase = AttemptPhase::Opening;
        self.attempts += 1;
        Some(Duration::from_millis(timeout_ms))
    }

    /// The settle delay elapsed and CONNECT went out.
    pub fn connect_sent(&mut self) {
        if self.phase == AttemptPhase::Opening {
            self.phase = AttemptPhase::AwaitingConnAck;
        }
    }

    pub fn is_probing(&self) -> bool {
        matches!(
            self.phase,
            AttemptPhase::Opening | AttemptPhase::AwaitingConnAck
        )
    }

    /// Records the CONNACK outcome. Returns `true` when the session was accepted.
    pub fn on_connack(&mut self, code: ConnectReturnCode) -> bool {
        if code.is_accepted() {
            self.phase = AttemptPhase::Accepted;
            true
        } else {
            self.phase = AttemptPhase::Rejected;
            self.rejection = Some(code);
            self.last_failure = Some(CandidateFailure::Rejected(code));
            false
        }
    }

    pub fn on_failure(&mut self, failure: CandidateFailure) {
        self.phase = match failure {
            CandidateFailure::TimedOut => AttemptPhase::TimedOut,
            CandidateFailure::Rejected(_) => AttemptPhase::Rejected,
            CandidateFailure::Transport(_) | CandidateFailure::Closed(_) => {
                AttemptPhase::TransportError
            }
        };
        self.last_failure = Some(failure);
    }

    /// Steps to the next candidate. Returns `false` when the list is exhausted.
    pub fn advance(&mut self) -> bool {
        self.index += 1;
        self.phase = AttemptPhase::Idle;
        self.index < self.candidates.len()
    }

    /// The error reported once no candidate produced a session.
    pub fn exhausted_error(&self) -> MqttError {
        let reason = match (&self.rejection, &self.last_failure) {
            (Some(code), _) => format!("broker rejected the connection ({})", code),
            (None, Some(CandidateFailure::TimedOut)) => "last attempt timed out".to_string(),
            (None, Some(CandidateFailure::Transport(e))) => e.clone(),
            (None, Some(CandidateFailure::Closed(Some(code)))) => {
                format!("connection closed with code {}", code)
            }
            (None, Some(CandidateFailure::Closed(None))) => "connection closed".to_string(),
            (None, Some(CandidateFailure::Rejected(code))) => code.to_string(),
            (None, None) => "no connection candidates".to_string(),
        };
        MqttError::ConnectFailed {
            attempts: self.attempts,
            reason,
        }
    }
}
