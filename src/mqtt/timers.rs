//! Cancellable timers for the engine loop
//!
//! Each armed timer is a small tokio task that sleeps and then posts a
//! [`TimerFired`] into the engine's queue. Arming a kind again or cancelling it
//! cancels the task through its `CancellationToken`, and every arm gets a fresh
//! sequence number: a firing is only accepted while its sequence is the one
//! currently armed, so a firing already queued when the timer was cancelled is
//! discarded.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    /// Per-candidate probe timeout
    AttemptTimeout,
    /// Delay between transport open and CONNECT
    Settle,
    /// Pause before the next candidate
    Debounce,
    /// Periodic PINGREQ
    KeepAlive,
    /// Delay before an automatic reconnect
    Reconnect,
    /// Grace period of a QoS 1 publish
    PublishGrace(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerFired {
    pub kind: TimerKind,
    pub seq: u64,
}

struct Armed {
    seq: u64,
    token: CancellationToken,
    periodic: bool,
}

pub(crate) struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    root: CancellationToken,
    armed: HashMap<TimerKind, Armed>,
    next_seq: u64,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            root: CancellationToken::new(),
            armed: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Arms a one-shot timer, replacing any timer of the same kind.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        let (seq, token) = self.prepare(kind, false);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => {
                    let _ = tx.send(TimerFired { kind, seq });
                }
            }
        });
    }

    /// Arms a periodic timer whose first tick comes after one full `period`.
    pub fn arm_periodic(&mut self, kind: TimerKind, period: Duration) {
        let (seq, token) = self.prepare(kind, true);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        if tx.send(TimerFired { kind, seq }).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn prepare(&mut self, kind: TimerKind, periodic: bool) -> (u64, CancellationToken) {
        self.cancel(kind);
        self.next_seq += 1;
        let seq = self.next_seq;
        let token = self.root.child_token();
        self.armed.insert(
            kind,
            Armed {
                seq,
                token: token.clone(),
                periodic,
            },
        );
        (seq, token)
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.armed.remove(&kind) {
            Some(armed) => {
                armed.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every timer matching `predicate`.
    pub fn cancel_where(&mut self, predicate: impl Fn(&TimerKind) -> bool) {
        let kinds: Vec<TimerKind> = self.armed.keys().copied().filter(|k| predicate(k)).collect();
        for kind in kinds {
            self.cancel(kind);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.token.cancel();
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Checks a firing against the currently armed timer and retires one-shots.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.kind) {
            Some(armed) if armed.seq == fired.seq => {
                if !armed.periodic {
                    self.armed.remove(&fired.kind);
                }
                true
            }
            _ => false,
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
