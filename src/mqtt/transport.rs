//! # Transport Boundary
//!
//! Abstracts the full-duplex socket MQTT rides on. A [`Transport`] opens [`Link`]s;
//! each link reports `Open`, `Message`, `Error` and `Close` through an [`EventSink`]
//! tagged with the link's id, so the engine can drop events from links it has
//! already abandoned.
//!
//! [`WebSocketTransport`] is the production implementation on top of
//! `tokio-tungstenite`. Tests provide in-memory transports.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Once};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

/// Identifies one opened link. Never reused within an engine.
pub type LinkId = u64;

/// Events a link reports back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(Vec<u8>),
    Error(String),
    Close(Option<u16>),
}

/// Readiness of a link, mirroring the WebSocket ready states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Ready state shared between a link handle and its I/O task.
#[derive(Debug, Clone)]
pub struct SharedReadyState(Arc<AtomicU8>);

impl Default for SharedReadyState {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(ReadyState::Connecting as u8)))
    }
}

impl SharedReadyState {
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Link is not open (state {0:?})")]
    NotOpen(ReadyState),

    #[error("Link task has stopped")]
    Stopped,
}

/// Delivers a link's events to the engine, tagged with the link id.
#[derive(Debug, Clone)]
pub struct EventSink {
    link: LinkId,
    tx: mpsc::UnboundedSender<(LinkId, TransportEvent)>,
}

impl EventSink {
    pub(crate) fn new(link: LinkId, tx: mpsc::UnboundedSender<(LinkId, TransportEvent)>) -> Self {
        Self { link, tx }
    }

    pub fn link_id(&self) -> LinkId {
        self.link
    }

    /// Returns `false` once the engine has stopped listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.link, event)).is_ok()
    }
}

/// Opens links to a URL with a requested sub-protocol.
pub trait Transport: Send + Sync + 'static {
    /// Starts opening `url`. Must not block: progress is reported through `events`.
    fn open(&self, url: &str, protocol: &str, events: EventSink) -> Box<dyn Link>;
}

/// Handle to one opened (or opening) socket.
pub trait Link: Send {
    /// Queues one binary frame. Fails unless the link is open.
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Starts closing. Idempotent.
    fn close(&mut self);

    fn ready_state(&self) -> ReadyState;
}

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// MQTT over WebSocket using `tokio-tungstenite`, `wss` through rustls.
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

/// rustls needs a process-level crypto provider before the first `wss` handshake.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("A rustls crypto provider was already installed");
        }
    });
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &str, protocol: &str, events: EventSink) -> Box<dyn Link> {
        install_crypto_provider();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let state = SharedReadyState::default();

        tokio::spawn(run_link(
            url.to_string(),
            protocol.to_string(),
            out_rx,
            events,
            state.clone(),
        ));

        Box::new(WebSocketLink { out_tx, state })
    }
}

struct WebSocketLink {
    out_tx: mpsc::UnboundedSender<Outbound>,
    state: SharedReadyState,
}

impl Link for WebSocketLink {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self.state.get() {
            ReadyState::Open => self
                .out_tx
                .send(Outbound::Frame(frame))
                .map_err(|_| TransportError::Stopped),
            other => Err(TransportError::NotOpen(other)),
        }
    }

    fn close(&mut self) {
        if matches!(self.state.get(), ReadyState::Closing | ReadyState::Closed) {
            return;
        }
        self.state.set(ReadyState::Closing);
        let _ = self.out_tx.send(Outbound::Close);
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_link(
    url: String,
    protocol: String,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    events: EventSink,
    state: SharedReadyState,
) {
    let link = events.link_id();

    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            state.set(ReadyState::Closed);
            events.emit(TransportEvent::Error(format!("Invalid URL {}: {}", url, e)));
            events.emit(TransportEvent::Close(None));
            return;
        }
    };
    match HeaderValue::from_str(&protocol) {
        Ok(value) => {
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }
        Err(e) => warn!("Not requesting sub-protocol {:?}: {}", protocol, e),
    }

    debug!("Link {} opening {}", link, url);
    let ws = tokio::select! {
        result = tokio_tungstenite::connect_async(request) => result,
        _ = wait_for_close(&mut out_rx) => {
            debug!("Link {} closed while opening", link);
            state.set(ReadyState::Closed);
            return;
        }
    };

    let ws = match ws {
        Ok((ws, _response)) => ws,
        Err(e) => {
            state.set(ReadyState::Closed);
            events.emit(TransportEvent::Error(e.to_string()));
            events.emit(TransportEvent::Close(None));
            return;
        }
    };

    if state.get() == ReadyState::Connecting {
        state.set(ReadyState::Open);
    }
    events.emit(TransportEvent::Open);

    let (mut ws_write, mut ws_read) = ws.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = ws_write.send(Message::Binary(frame)).await {
                        state.set(ReadyState::Closed);
                        events.emit(TransportEvent::Error(e.to_string()));
                        events.emit(TransportEvent::Close(None));
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    state.set(ReadyState::Closing);
                    if let Err(e) = ws_write.close().await {
                        debug!("Link {} close handshake failed: {}", link, e);
                    }
                    state.set(ReadyState::Closed);
                    events.emit(TransportEvent::Close(None));
                    return;
                }
            },
            inbound = ws_read.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    events.emit(TransportEvent::Message(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    state.set(ReadyState::Closed);
                    events.emit(TransportEvent::Close(frame.map(|f| u16::from(f.code))));
                    return;
                }
                Some(Ok(other)) => {
                    // Ping/pong is answered by tungstenite; text frames are not MQTT.
                    debug!("Link {} ignoring non-binary frame ({} bytes)", link, other.len());
                }
                Some(Err(e)) => {
                    state.set(ReadyState::Closed);
                    events.emit(TransportEvent::Error(e.to_string()));
                    events.emit(TransportEvent::Close(None));
                    return;
                }
                None => {
                    state.set(ReadyState::Closed);
                    events.emit(TransportEvent::Close(None));
                    return;
                }
            }
        }
    }
}

/// Resolves once the handle asked to close or was dropped. Frames queued before
/// the socket opened are kept.
async fn wait_for_close(out_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    loop {
        match out_rx.recv().await {
            Some(Outbound::Close) | None => return,
            Some(Outbound::Frame(_)) => {
                debug!("Dropping frame queued before the link opened");
            }
        }
    }
}
