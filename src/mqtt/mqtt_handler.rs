//! Connection manager
//!
//! [`MqttHandle`] is the public client. Every operation is sent as an [`MqttAction`]
//! to a single engine task ([`MqttHandler`]) that owns all mutable state: the live
//! link, the candidate probe, timers, subscriptions and in-flight publishes. The
//! engine reacts to three inputs one at a time, so no two state transitions ever
//! interleave:
//!
//! - API actions, answered through their `response_tx`
//! - transport events, tagged with the id of the link that produced them
//! - timer firings, tagged with the sequence number of the arm that produced them
//!
//! Events from a link that is no longer current and firings of a timer that was
//! re-armed or cancelled are dropped before they can touch any state.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──CONNACK 0──► Connected
//!       ▲                        │                        │ link lost
//!       └──── all candidates ────┘                        ▼
//!       ▲         failed                             Reconnecting ──CONNACK 0──► Connected
//!       └───────────── reconnect attempts exhausted ──────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::attempt::{AttemptPhase, AttemptRunner, CandidateFailure};
use super::config::{BrokerConfig, ConnectRequest};
use super::error::MqttError;
use super::message_manager::{ListenerId, MessageManager, MqttMessage};
use super::packet::{
    self, build_connect, build_disconnect, build_pingreq, build_puback, decode_packet, Packet,
    PacketIds, PacketReader, QoS,
};
use super::timers::{TimerFired, TimerKind, Timers};
use super::transport::{
    EventSink, Link, LinkId, ReadyState, Transport, TransportEvent, WebSocketTransport,
};
use crate::config::ClientSettings;
use crate::persistence::{ConfigStore, TomlConfigStore};

/// WebSocket sub-protocol requested on every link.
pub const MQTT_SUBPROTOCOL: &str = "mqtt";

/// Topic `test_connection` publishes to.
pub const TEST_TOPIC: &str = "test/connection";

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot returned by [`MqttHandle::status`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MqttStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub config: Option<BrokerConfig>,
    /// Subscribed topic filters in the order they were first subscribed
    pub subscriptions: Vec<String>,
    pub reconnect_attempts: u32,
}

type Responder<T> = oneshot::Sender<Result<T, MqttError>>;

#[derive(Debug)]
pub(crate) enum MqttAction {
    Connect {
        request: ConnectRequest,
        response_tx: Responder<()>,
    },
    Reconnect {
        response_tx: Responder<()>,
    },
    Disconnect {
        response_tx: Responder<()>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        response_tx: Responder<()>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        response_tx: Responder<()>,
    },
    Unsubscribe {
        topic: String,
        response_tx: Responder<()>,
    },
    Status {
        response_tx: oneshot::Sender<MqttStatus>,
    },
}

fn respond<T>(response_tx: oneshot::Sender<T>, value: T) {
    if response_tx.send(value).is_err() {
        debug!("Caller went away before the response was ready");
    }
}

/// Handle to an MQTT-over-WebSocket client.
///
/// Cheap to clone; all clones drive the same engine. The engine shuts down (sending
/// a best-effort DISCONNECT) once the last clone is dropped.
#[derive(Clone, Debug)]
pub struct MqttHandle {
    tx: mpsc::Sender<MqttAction>,
    messages: MessageManager,
}

impl MqttHandle {
    /// Spawns the engine on the current tokio runtime.
    pub fn spawn(
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.action_buffer.max(1));
        let messages = MessageManager::default();
        let handler = MqttHandler::new(settings, transport, store, messages.clone());
        tokio::spawn(handler.run(rx));
        Self { tx, messages }
    }

    /// WebSocket transport, default settings and the config file in the home directory.
    pub fn with_defaults() -> Self {
        Self::spawn(
            ClientSettings::default(),
            Arc::new(WebSocketTransport),
            Arc::new(TomlConfigStore::default_location()),
        )
    }

    async fn request<T>(
        &self,
        action: impl FnOnce(oneshot::Sender<T>) -> MqttAction,
    ) -> Result<T, MqttError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(action(response_tx))
            .await
            .map_err(|_| MqttError::EngineStopped)?;
        response_rx.await.map_err(|_| MqttError::EngineStopped)
    }

    /// Probes the candidates for `request` until one is accepted.
    ///
    /// Resolves immediately when already connected; joins the probe already in
    /// flight when one is running.
    pub async fn connect(&self, request: ConnectRequest) -> Result<(), MqttError> {
        self.request(|response_tx| MqttAction::Connect {
            request,
            response_tx,
        })
        .await?
    }

    /// Connects with the current or saved broker config and re-subscribes every topic.
    pub async fn reconnect(&self) -> Result<(), MqttError> {
        self.request(|response_tx| MqttAction::Reconnect { response_tx })
            .await?
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.request(|response_tx| MqttAction::Disconnect { response_tx })
            .await?
    }

    /// QoS 0 resolves once the frame is handed to the transport. QoS 1 resolves on
    /// PUBACK or, without one, after the publish grace period.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
    ) -> Result<(), MqttError> {
        let topic = topic.into();
        let payload = payload.into();
        self.request(|response_tx| MqttAction::Publish {
            topic,
            payload,
            qos,
            response_tx,
        })
        .await?
    }

    pub async fn subscribe(&self, topic: impl Into<String>, qos: QoS) -> Result<(), MqttError> {
        let topic = topic.into();
        self.request(|response_tx| MqttAction::Subscribe {
            topic,
            qos,
            response_tx,
        })
        .await?
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), MqttError> {
        let topic = topic.into();
        self.request(|response_tx| MqttAction::Unsubscribe { topic, response_tx })
            .await?
    }

    pub async fn status(&self) -> Result<MqttStatus, MqttError> {
        self.request(|response_tx| MqttAction::Status { response_tx })
            .await
    }

    /// Publishes a small JSON document to `test/connection` and returns it.
    pub async fn test_connection(&self) -> Result<String, MqttError> {
        let status = self.status().await?;
        let client_id = match (&status.config, status.connected) {
            (Some(config), true) => config.client_id.clone(),
            _ => return Err(MqttError::NotConnected),
        };
        let payload = serde_json::json!({
            "message": "Connection test",
            "client_id": client_id,
            "timestamp": Local::now().to_rfc3339(),
        });
        let payload =
            serde_json::to_string(&payload).map_err(|e| MqttError::Serialization(e.to_string()))?;
        self.publish(TEST_TOPIC, payload.clone(), QoS::AtMostOnce)
            .await?;
        Ok(payload)
    }

    /// Registers a listener for every received message.
    ///
    /// Listeners are owned by the engine. A listener that captures a clone of this
    /// handle keeps the engine running after every other clone is dropped, until the
    /// listener is removed again.
    pub fn add_message_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MqttMessage) + Send + Sync + 'static,
    {
        self.messages.add_message_listener(listener)
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.messages.remove_message_listener(id)
    }

    /// Sets the single error listener, called with `(message, title)`.
    pub fn set_error_listener<F>(&self, listener: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.messages.set_error_listener(Some(Arc::new(listener)));
    }

    pub fn clear_error_listener(&self) {
        self.messages.set_error_listener(None);
    }

    pub fn message_channel(&self, capacity: usize) -> mpsc::Receiver<MqttMessage> {
        self.messages.message_channel(capacity)
    }
}

struct ActiveLink {
    id: LinkId,
    link: Box<dyn Link>,
}

/// One connect cycle walking the candidate list.
struct Probe {
    runner: AttemptRunner,
    waiters: Vec<Responder<()>>,
    /// Started by the reconnect timer rather than by a caller
    automatic: bool,
}

pub(crate) struct MqttHandler {
    settings: ClientSettings,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ConfigStore>,
    messages: MessageManager,

    events_tx: mpsc::UnboundedSender<(LinkId, TransportEvent)>,
    events_rx: mpsc::UnboundedReceiver<(LinkId, TransportEvent)>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    timers: Timers,

    state: ConnectionState,
    config: Option<BrokerConfig>,
    link: Option<ActiveLink>,
    next_link_id: LinkId,
    reader: PacketReader,
    probe: Option<Probe>,
    reconnect_attempts: u32,

    subscriptions: Vec<(String, QoS)>,
    pending_subacks: HashMap<u16, String>,
    packet_ids: PacketIds,
    in_flight: HashMap<u16, Responder<()>>,
}

impl MqttHandler {
    fn new(
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConfigStore>,
        messages: MessageManager,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let reader = PacketReader::with_limit(settings.max_packet_size);
        Self {
            settings,
            transport,
            store,
            messages,
            events_tx,
            events_rx,
            timer_rx,
            timers: Timers::new(timer_tx),
            state: ConnectionState::Disconnected,
            config: None,
            link: None,
            next_link_id: 0,
            reader,
            probe: None,
            reconnect_attempts: 0,
            subscriptions: Vec::new(),
            pending_subacks: HashMap::new(),
            packet_ids: PacketIds::default(),
            in_flight: HashMap::new(),
        }
    }

    async fn run(mut self, mut actions: mpsc::Receiver<MqttAction>) {
        debug!("MQTT engine started");
        loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(action) => self.handle_action(action),
                    None => break,
                },
                Some((link, event)) = self.events_rx.recv() => self.handle_link_event(link, event),
                Some(fired) = self.timer_rx.recv() => self.handle_timer(fired),
            }
        }
        self.shutdown();
        debug!("MQTT engine stopped");
    }

    fn shutdown(&mut self) {
        self.teardown_link(true);
        self.timers.cancel_all();
        if let Some(probe) = self.probe.take() {
            for waiter in probe.waiters {
                respond(waiter, Err(MqttError::EngineStopped));
            }
        }
        self.fail_in_flight(MqttError::EngineStopped);
        self.state = ConnectionState::Disconnected;
    }

    fn handle_action(&mut self, action: MqttAction) {
        match action {
            MqttAction::Connect {
                request,
                response_tx,
            } => self.connect(request, response_tx),
            MqttAction::Reconnect { response_tx } => self.reconnect(response_tx),
            MqttAction::Disconnect { response_tx } => {
                self.disconnect();
                respond(response_tx, Ok(()));
            }
            MqttAction::Publish {
                topic,
                payload,
                qos,
                response_tx,
            } => self.publish(topic, payload, qos, response_tx),
            MqttAction::Subscribe {
                topic,
                qos,
                response_tx,
            } => respond(response_tx, self.subscribe(topic, qos)),
            MqttAction::Unsubscribe { topic, response_tx } => {
                respond(response_tx, self.unsubscribe(&topic))
            }
            MqttAction::Status { response_tx } => respond(response_tx, self.status()),
        }
    }

    fn status(&self) -> MqttStatus {
        MqttStatus {
            state: self.state,
            connected: self.state == ConnectionState::Connected,
            config: self.config.clone(),
            subscriptions: self
                .subscriptions
                .iter()
                .map(|(topic, _)| topic.clone())
                .collect(),
            reconnect_attempts: self.reconnect_attempts,
        }
    }

    fn is_live(&self) -> bool {
        self.state == ConnectionState::Connected
            && self
                .link
                .as_ref()
                .is_some_and(|active| active.link.ready_state() == ReadyState::Open)
    }

    // ---- API operations ----

    fn connect(&mut self, request: ConnectRequest, response_tx: Responder<()>) {
        if self.is_live() {
            debug!("Already connected, connect resolves immediately");
            respond(response_tx, Ok(()));
            return;
        }
        if let Some(probe) = self.probe.as_mut() {
            debug!("Joining the connect already in flight");
            probe.waiters.push(response_tx);
            return;
        }
        let config = match request.into_config() {
            Ok(config) => config,
            Err(e) => {
                respond(response_tx, Err(e));
                return;
            }
        };

        self.reset_connection(MqttError::ConnectionLost);
        self.reconnect_attempts = 0;
        // a clean session starts without subscriptions
        self.subscriptions.clear();
        self.state = ConnectionState::Connecting;
        info!(
            "Connecting to {}:{} as {}",
            config.host, config.port, config.client_id
        );
        self.start_probe(config, false, false, vec![response_tx]);
    }

    fn reconnect(&mut self, response_tx: Responder<()>) {
        if self.is_live() {
            respond(response_tx, Ok(()));
            return;
        }
        if let Some(probe) = self.probe.as_mut() {
            probe.waiters.push(response_tx);
            return;
        }
        let Some(config) = self.config.clone().or_else(|| self.store.load_config()) else {
            warn!("Reconnect requested without a known broker config");
            respond(response_tx, Err(MqttError::NoBrokerConfig));
            return;
        };

        self.reset_connection(MqttError::ConnectionLost);
        self.state = ConnectionState::Reconnecting;
        self.config = Some(config.clone());
        info!("Reconnecting to {}:{}", config.host, config.port);
        self.start_probe(config, true, false, vec![response_tx]);
    }

    fn disconnect(&mut self) {
        if let Some(probe) = self.probe.take() {
            for waiter in probe.waiters {
                respond(waiter, Err(MqttError::Cancelled));
            }
        }
        self.reset_connection(MqttError::Cancelled);
        self.state = ConnectionState::Disconnected;
        self.config = None;
        self.reconnect_attempts = 0;
        info!("Disconnected");
    }

    fn publish(&mut self, topic: String, payload: Vec<u8>, qos: QoS, response_tx: Responder<()>) {
        if !self.is_live() {
            respond(response_tx, Err(MqttError::NotConnected));
            return;
        }
        let (frame, packet_id) =
            match packet::build_publish(&topic, &payload, qos, &mut self.packet_ids) {
                Ok(built) => built,
                Err(e) => {
                    respond(response_tx, Err(e.into()));
                    return;
                }
            };

        if let Err(e) = self.send_frame(frame) {
            if let Some(id) = packet_id {
                self.packet_ids.release(id);
            }
            respond(response_tx, Err(e));
            return;
        }

        match packet_id {
            Some(id) => {
                debug!("Published to {} (packet {}), awaiting PUBACK", topic, id);
                self.in_flight.insert(id, response_tx);
                self.timers
                    .arm(TimerKind::PublishGrace(id), self.settings.publish_grace());
            }
            None => {
                debug!("Published {} bytes to {}", payload.len(), topic);
                respond(response_tx, Ok(()));
            }
        }
    }

    fn subscribe(&mut self, topic: String, qos: QoS) -> Result<(), MqttError> {
        if !self.is_live() {
            return Err(MqttError::NotConnected);
        }
        self.send_subscribe(&topic, qos)?;
        match self.subscriptions.iter_mut().find(|(t, _)| *t == topic) {
            Some(existing) => existing.1 = qos,
            None => self.subscriptions.push((topic.clone(), qos)),
        }
        info!("Subscribed to {}", topic);
        Ok(())
    }

    fn send_subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let (frame, packet_id) = packet::build_subscribe(topic, qos, &mut self.packet_ids)?;
        self.send_frame(frame)?;
        self.pending_subacks.insert(packet_id, topic.to_string());
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        if !self.is_live() {
            return Err(MqttError::NotConnected);
        }
        let (frame, _) = packet::build_unsubscribe(topic, &mut self.packet_ids)?;
        self.send_frame(frame)?;
        self.subscriptions.retain(|(t, _)| t != topic);
        info!("Unsubscribed from {}", topic);
        Ok(())
    }

    // ---- link handling ----

    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), MqttError> {
        let active = self.link.as_mut().ok_or(MqttError::NotConnected)?;
        active
            .link
            .send(frame)
            .map_err(|e| MqttError::Transport(e.to_string()))
    }

    /// Closes the current link, if any. `graceful` sends DISCONNECT first.
    fn teardown_link(&mut self, graceful: bool) {
        if let Some(mut active) = self.link.take() {
            if graceful && active.link.ready_state() == ReadyState::Open {
                if let Err(e) = active.link.send(build_disconnect()) {
                    debug!("DISCONNECT not sent: {}", e);
                }
            }
            active.link.close();
            debug!("Closed link {}", active.id);
        }
        self.reader.clear();
    }

    /// Drops the session: link, timers, pending acknowledgements.
    fn reset_connection(&mut self, in_flight_error: MqttError) {
        self.teardown_link(true);
        self.timers.cancel_all();
        self.fail_in_flight(in_flight_error);
        self.pending_subacks.clear();
    }

    fn fail_in_flight(&mut self, error: MqttError) {
        for (id, response_tx) in self.in_flight.drain() {
            self.packet_ids.release(id);
            self.timers.cancel(TimerKind::PublishGrace(id));
            respond(response_tx, Err(error.clone()));
        }
    }

    fn handle_link_event(&mut self, link: LinkId, event: TransportEvent) {
        if self.link.as_ref().map(|active| active.id) != Some(link) {
            debug!("Ignoring {:?} from stale link {}", event, link);
            return;
        }
        match event {
            TransportEvent::Open => self.on_link_open(),
            TransportEvent::Message(data) => self.on_link_data(&data),
            TransportEvent::Error(e) => self.on_link_down(CandidateFailure::Transport(e)),
            TransportEvent::Close(code) => self.on_link_down(CandidateFailure::Closed(code)),
        }
    }

    fn on_link_open(&mut self) {
        let opening = self
            .probe
            .as_ref()
            .is_some_and(|probe| probe.runner.phase() == AttemptPhase::Opening);
        if opening {
            self.timers
                .arm(TimerKind::Settle, self.settings.settle_delay());
        }
    }

    fn on_link_data(&mut self, data: &[u8]) {
        self.reader.push(data);
        loop {
            match self.reader.next_frame() {
                Ok(Some(frame)) => match decode_packet(&frame) {
                    Ok(Some(packet)) => self.handle_packet(packet),
                    Ok(None) => debug!("Ignoring unsupported packet ({} bytes)", frame.len()),
                    Err(e) => warn!("Dropping malformed packet: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Inbound stream is corrupt, dropping the link: {}", e);
                    self.on_link_down(CandidateFailure::Transport(e.to_string()));
                    break;
                }
            }
        }
    }

    fn on_link_down(&mut self, failure: CandidateFailure) {
        if self.probe.as_ref().is_some_and(|probe| probe.runner.is_probing()) {
            self.candidate_failed(failure);
        } else if self.state == ConnectionState::Connected {
            warn!("Connection lost: {:?}", failure);
            self.connection_lost();
        } else {
            self.teardown_link(false);
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::ConnAck { code, .. } => {
                let awaiting = self
                    .probe
                    .as_ref()
                    .is_some_and(|probe| probe.runner.phase() == AttemptPhase::AwaitingConnAck);
                if !awaiting {
                    debug!("Ignoring unexpected CONNACK ({})", code);
                    return;
                }
                let accepted = self
                    .probe
                    .as_mut()
                    .is_some_and(|probe| probe.runner.on_connack(code));
                if accepted {
                    self.on_accepted();
                } else if self.settings.abort_on_rejection {
                    self.abort_probe(MqttError::ConnectionRefused(code));
                } else {
                    debug!("Broker rejected the connection ({}), trying next candidate", code);
                    self.candidate_failed(CandidateFailure::Rejected(code));
                }
            }
            Packet::Publish(publish) => {
                if let (1, Some(id)) = (publish.qos, publish.packet_id) {
                    if let Err(e) = self.send_frame(build_puback(id)) {
                        warn!("Could not acknowledge packet {}: {}", id, e);
                    }
                }
                let message = MqttMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                    received_at: Local::now(),
                };
                self.messages.dispatch_message(&message);
            }
            Packet::PubAck { packet_id } => match self.in_flight.remove(&packet_id) {
                Some(response_tx) => {
                    self.packet_ids.release(packet_id);
                    self.timers.cancel(TimerKind::PublishGrace(packet_id));
                    respond(response_tx, Ok(()));
                }
                None => debug!("PUBACK for unknown packet {}", packet_id),
            },
            Packet::SubAck {
                packet_id,
                return_codes,
            } => {
                let Some(topic) = self.pending_subacks.remove(&packet_id) else {
                    return;
                };
                if return_codes.contains(&packet::SUBACK_FAILURE) {
                    warn!("Broker refused subscription to {}", topic);
                    self.subscriptions.retain(|(t, _)| *t != topic);
                } else {
                    debug!("Subscription to {} granted {:?}", topic, return_codes);
                }
            }
            Packet::UnsubAck { packet_id } => debug!("UNSUBACK {}", packet_id),
            Packet::PingResp => debug!("PINGRESP"),
        }
    }

    // ---- candidate probing ----

    fn start_probe(
        &mut self,
        config: BrokerConfig,
        is_reconnect: bool,
        automatic: bool,
        waiters: Vec<Responder<()>>,
    ) {
        self.probe = Some(Probe {
            runner: AttemptRunner::new(config, is_reconnect),
            waiters,
            automatic,
        });
        self.open_candidate();
    }

    fn open_candidate(&mut self) {
        let next = self.probe.as_mut().and_then(|probe| {
            let timeout = probe.runner.begin(&self.settings)?;
            let url = probe.runner.current_url()?;
            Some((timeout, url))
        });
        let Some((timeout, url)) = next else {
            if self.probe.is_some() {
                self.probe_exhausted();
            }
            return;
        };

        self.teardown_link(false);
        self.next_link_id += 1;
        let id = self.next_link_id;
        let events = EventSink::new(id, self.events_tx.clone());
        let link = self.transport.open(&url, MQTT_SUBPROTOCOL, events);
        self.link = Some(ActiveLink { id, link });
        self.timers.arm(TimerKind::AttemptTimeout, timeout);
        debug!("Trying {} (link {}, timeout {:?})", url, id, timeout);
    }

    fn send_connect(&mut self) {
        let frame = {
            let Some(probe) = self.probe.as_ref() else {
                return;
            };
            if probe.runner.phase() != AttemptPhase::Opening {
                return;
            }
            let config = probe.runner.config();
            build_connect(
                &config.client_id,
                config.username.as_deref(),
                config.password.as_deref(),
                self.settings.keep_alive_secs,
            )
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                self.abort_probe(e.into());
                return;
            }
        };
        match self.send_frame(frame) {
            Ok(()) => {
                if let Some(probe) = self.probe.as_mut() {
                    probe.runner.connect_sent();
                }
            }
            Err(e) => self.candidate_failed(CandidateFailure::Transport(e.to_string())),
        }
    }

    fn candidate_failed(&mut self, failure: CandidateFailure) {
        self.timers.cancel(TimerKind::AttemptTimeout);
        self.timers.cancel(TimerKind::Settle);
        self.teardown_link(false);
        let Some(probe) = self.probe.as_mut() else {
            return;
        };
        debug!(
            "Candidate {} failed: {:?}",
            probe.runner.current_url().unwrap_or_default(),
            failure
        );
        probe.runner.on_failure(failure);
        self.timers
            .arm(TimerKind::Debounce, self.settings.attempt_debounce());
    }

    fn next_candidate(&mut self) {
        let advanced = match self.probe.as_mut() {
            Some(probe) => probe.runner.advance(),
            None => return,
        };
        if advanced {
            self.open_candidate();
        } else {
            self.probe_exhausted();
        }
    }

    fn cancel_probe_timers(&mut self) {
        self.timers.cancel_where(|kind| {
            matches!(
                kind,
                TimerKind::AttemptTimeout | TimerKind::Settle | TimerKind::Debounce
            )
        });
    }

    fn abort_probe(&mut self, error: MqttError) {
        self.cancel_probe_timers();
        self.teardown_link(false);
        if let Some(probe) = self.probe.take() {
            self.probe_failed(probe, error);
        }
    }

    fn probe_exhausted(&mut self) {
        if let Some(probe) = self.probe.take() {
            let error = probe.runner.exhausted_error();
            self.probe_failed(probe, error);
        }
    }

    fn probe_failed(&mut self, probe: Probe, error: MqttError) {
        for waiter in probe.waiters {
            respond(waiter, Err(error.clone()));
        }
        if probe.automatic {
            warn!(
                "Reconnect attempt {} failed: {}",
                self.reconnect_attempts, error
            );
            self.schedule_reconnect();
        } else {
            warn!("Connection failed: {}", error);
            self.state = ConnectionState::Disconnected;
            self.config = None;
            self.messages
                .dispatch_error(&error.to_string(), "Connection failed");
        }
    }

    fn on_accepted(&mut self) {
        self.cancel_probe_timers();
        let Some(probe) = self.probe.take() else {
            return;
        };
        let url = probe.runner.current_url().unwrap_or_default();
        let resubscribe = probe.runner.is_reconnect();
        let config = probe.runner.into_config();

        if !probe.automatic {
            self.store.save_config(&config);
        }
        info!("Connected to {} as {}", url, config.client_id);
        self.config = Some(config);
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.timers
            .arm_periodic(TimerKind::KeepAlive, self.settings.ping_interval());

        if resubscribe {
            let topics = self.subscriptions.clone();
            for (topic, qos) in topics {
                match self.send_subscribe(&topic, qos) {
                    Ok(()) => debug!("Re-subscribed to {}", topic),
                    Err(e) => warn!("Re-subscribing to {} failed: {}", topic, e),
                }
            }
        }

        for waiter in probe.waiters {
            respond(waiter, Ok(()));
        }
    }

    // ---- reconnection ----

    fn connection_lost(&mut self) {
        self.teardown_link(false);
        self.timers.cancel(TimerKind::KeepAlive);
        self.fail_in_flight(MqttError::ConnectionLost);
        self.pending_subacks.clear();
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let Some(config) = self.config.as_ref() else {
            self.state = ConnectionState::Disconnected;
            return;
        };
        if self.reconnect_attempts < self.settings.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            self.state = ConnectionState::Reconnecting;
            info!(
                "Reconnecting to {}:{} in {:?} (attempt {}/{})",
                config.host,
                config.port,
                self.settings.reconnect_delay(),
                self.reconnect_attempts,
                self.settings.max_reconnect_attempts
            );
            self.timers
                .arm(TimerKind::Reconnect, self.settings.reconnect_delay());
        } else {
            let message = format!(
                "Lost connection to {}:{}; giving up after {} reconnect attempts",
                config.host, config.port, self.reconnect_attempts
            );
            error!("{}", message);
            self.timers.cancel_all();
            self.state = ConnectionState::Disconnected;
            self.config = None;
            self.messages.dispatch_error(&message, "Connection lost");
        }
    }

    // ---- timers ----

    fn handle_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            debug!("Ignoring stale {:?} timer", fired.kind);
            return;
        }
        match fired.kind {
            TimerKind::AttemptTimeout => {
                debug!("Candidate timed out");
                self.candidate_failed(CandidateFailure::TimedOut);
            }
            TimerKind::Settle => self.send_connect(),
            TimerKind::Debounce => self.next_candidate(),
            TimerKind::KeepAlive => {
                if let Err(e) = self.send_frame(build_pingreq()) {
                    warn!("PINGREQ not sent: {}", e);
                }
            }
            TimerKind::Reconnect => {
                let Some(config) = self.config.clone() else {
                    self.state = ConnectionState::Disconnected;
                    return;
                };
                self.start_probe(config, true, true, Vec::new());
            }
            TimerKind::PublishGrace(id) => {
                if let Some(response_tx) = self.in_flight.remove(&id) {
                    self.packet_ids.release(id);
                    warn!("No PUBACK for packet {} within grace period, assuming delivered", id);
                    respond(response_tx, Ok(()));
                }
            }
        }
    }
}
