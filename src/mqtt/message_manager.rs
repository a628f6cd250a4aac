//! Event fan-out
//!
//! Delivers received messages to every registered listener and connection failures
//! to the single error slot. Listeners are snapshotted before dispatch, so a listener
//! may add or remove listeners (itself included) while being called.

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub received_at: DateTime<Local>,
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
            received_at: Local::now(),
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = self.payload_str();
        let preview: String = content.chars().take(32).collect();
        let ellipsis = if content.chars().count() > 32 { "..." } else { "" };
        write!(
            f,
            "{} [{}] {}{}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            preview,
            ellipsis
        )
    }
}

pub type MessageListener = Arc<dyn Fn(&MqttMessage) + Send + Sync>;

/// Receives `(message, title)` for user-visible connection failures.
pub type ErrorListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Token returned on registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    message: Vec<(ListenerId, MessageListener)>,
    error: Option<ErrorListener>,
}

/// Shared listener registry. Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct MessageManager {
    inner: Arc<RwLock<Listeners>>,
}

impl fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let listeners = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MessageManager")
            .field("message_listeners", &listeners.message.len())
            .field("error_listener", &listeners.error.is_some())
            .finish()
    }
}

impl MessageManager {
    /// Adds `listener` and returns the id that removes it.
    ///
    /// The registry holds the listener until it is removed. Anything it captures that
    /// owns the registry, such as an `MqttHandle`, forms a cycle and is never freed
    /// while the listener stays registered.
    pub fn add_message_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MqttMessage) + Send + Sync + 'static,
    {
        let mut listeners = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        listeners.next_id += 1;
        let id = ListenerId(listeners.next_id);
        listeners.message.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.message.len();
        listeners.message.retain(|(listener_id, _)| *listener_id != id);
        listeners.message.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .message
            .len()
    }

    /// Replaces the error listener; `None` clears it.
    pub fn set_error_listener(&self, listener: Option<ErrorListener>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .error = listener;
    }

    /// Forwards every message into a bounded channel. Messages are dropped while the
    /// channel is full; the listener removes itself once the receiver is gone.
    pub fn message_channel(&self, capacity: usize) -> mpsc::Receiver<MqttMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let registry = self.clone();
        let slot: Arc<RwLock<Option<ListenerId>>> = Arc::default();
        let own_id = slot.clone();

        let id = self.add_message_listener(move |message| {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Message channel full, dropping message on {}", message.topic);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    if let Some(id) = *own_id.read().unwrap_or_else(PoisonError::into_inner) {
                        registry.remove_message_listener(id);
                    }
                }
            }
        });
        *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(id);
        rx
    }

    pub(crate) fn dispatch_message(&self, message: &MqttMessage) {
        let snapshot: Vec<MessageListener> = {
            let listeners = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            listeners.message.iter().map(|(_, l)| l.clone()).collect()
        };
        debug!(
            "Dispatching message on {} to {} listeners",
            message.topic,
            snapshot.len()
        );
        for listener in snapshot {
            listener(message);
        }
    }

    pub(crate) fn dispatch_error(&self, message: &str, title: &str) {
        let listener = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .clone();
        match listener {
            Some(listener) => listener(message, title),
            None => warn!("{}: {} (no error listener registered)", title, message),
        }
    }
}
