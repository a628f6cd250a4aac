#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use wsmqtt::mqtt::{
    EventSink, Link, ReadyState, SharedReadyState, Transport, TransportError, TransportEvent,
};

/// How the fake broker answers a link to a given URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Opens, and answers CONNECT with a CONNACK carrying this return code
    Accept(u8),
    /// Reports an error followed by a close
    Refuse,
    /// Never reports anything
    Hang,
    /// Opens, but never answers CONNECT
    OpenSilent,
}

struct FakeLinkRecord {
    url: String,
    protocol: String,
    sink: EventSink,
    state: SharedReadyState,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

type BehaviorFn = Box<dyn Fn(&str) -> Behavior + Send + Sync>;

struct FakeState {
    behavior: BehaviorFn,
    links: Vec<FakeLinkRecord>,
}

/// Scriptable in-memory transport. Events are emitted synchronously into the
/// engine's queue, so no extra tasks are involved.
#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new(behavior: impl Fn(&str) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeState {
                behavior: Box::new(behavior),
                links: Vec::new(),
            })),
        }
    }

    /// Accepts only `url`, refuses everything else.
    pub fn accepting(url: &'static str) -> Self {
        Self::new(move |candidate| {
            if candidate == url {
                Behavior::Accept(0)
            } else {
                Behavior::Refuse
            }
        })
    }

    pub fn set_behavior(&self, behavior: impl Fn(&str) -> Behavior + Send + Sync + 'static) {
        self.inner.lock().unwrap().behavior = Box::new(behavior);
    }

    pub fn opened_urls(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .links
            .iter()
            .map(|l| l.url.clone())
            .collect()
    }

    pub fn protocols(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .links
            .iter()
            .map(|l| l.protocol.clone())
            .collect()
    }

    /// Frames the engine sent on link `index` (in open order).
    pub fn sent(&self, index: usize) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().links[index].sent.lock().unwrap().clone()
    }

    /// Frames sent on the most recently opened link.
    pub fn sent_last(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let last = inner.links.last().expect("no link opened");
        let sent = last.sent.lock().unwrap().clone();
        sent
    }

    /// Emits an event as if it came from link `index`.
    pub fn emit(&self, index: usize, event: TransportEvent) {
        self.inner.lock().unwrap().links[index].sink.emit(event);
    }

    /// Delivers inbound bytes on the most recently opened link.
    pub fn inject(&self, data: Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        let last = inner.links.last().expect("no link opened");
        last.sink.emit(TransportEvent::Message(data));
    }

    /// Simulates the broker dropping the most recently opened link.
    pub fn drop_link(&self) {
        let inner = self.inner.lock().unwrap();
        let last = inner.links.last().expect("no link opened");
        last.state.set(ReadyState::Closed);
        last.sink.emit(TransportEvent::Close(Some(1006)));
    }
}

impl Transport for FakeTransport {
    fn open(&self, url: &str, protocol: &str, events: EventSink) -> Box<dyn Link> {
        let mut inner = self.inner.lock().unwrap();
        let behavior = (inner.behavior)(url);
        let state = SharedReadyState::default();
        let sent = Arc::new(Mutex::new(Vec::new()));

        match behavior {
            Behavior::Accept(_) | Behavior::OpenSilent => {
                state.set(ReadyState::Open);
                events.emit(TransportEvent::Open);
            }
            Behavior::Refuse => {
                state.set(ReadyState::Closed);
                events.emit(TransportEvent::Error("connection refused".to_string()));
                events.emit(TransportEvent::Close(None));
            }
            Behavior::Hang => {}
        }

        inner.links.push(FakeLinkRecord {
            url: url.to_string(),
            protocol: protocol.to_string(),
            sink: events.clone(),
            state: state.clone(),
            sent: sent.clone(),
        });

        Box::new(FakeLink {
            behavior,
            events,
            state,
            sent,
        })
    }
}

struct FakeLink {
    behavior: Behavior,
    events: EventSink,
    state: SharedReadyState,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Link for FakeLink {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state.get();
        if state != ReadyState::Open {
            return Err(TransportError::NotOpen(state));
        }
        if let (Some(0x10), Behavior::Accept(code)) = (frame.first().copied(), self.behavior) {
            self.events
                .emit(TransportEvent::Message(vec![0x20, 0x02, 0x00, code]));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&mut self) {
        self.state.set(ReadyState::Closed);
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }
}

/// Parses an outbound PUBLISH into `(topic, payload, packet id)`.
pub fn parse_publish(frame: &[u8]) -> (String, Vec<u8>, Option<u16>) {
    assert_eq!(frame[0] & 0xF0, 0x30, "not a PUBLISH: {:02X?}", frame);
    let qos = (frame[0] >> 1) & 0x03;
    let mut at = 1;
    while frame[at] & 0x80 != 0 {
        at += 1;
    }
    at += 1;
    let topic_len = u16::from_be_bytes([frame[at], frame[at + 1]]) as usize;
    at += 2;
    let topic = String::from_utf8(frame[at..at + topic_len].to_vec()).unwrap();
    at += topic_len;
    let id = if qos > 0 {
        let id = u16::from_be_bytes([frame[at], frame[at + 1]]);
        at += 2;
        Some(id)
    } else {
        None
    };
    (topic, frame[at..].to_vec(), id)
}

/// Topic of an outbound SUBSCRIBE.
pub fn parse_subscribe_topic(frame: &[u8]) -> String {
    assert_eq!(frame[0], 0x82, "not a SUBSCRIBE: {:02X?}", frame);
    // fixed header (2 bytes for short packets) + packet id
    let at = 4;
    let len = u16::from_be_bytes([frame[at], frame[at + 1]]) as usize;
    String::from_utf8(frame[at + 2..at + 2 + len].to_vec()).unwrap()
}

pub fn frames_of_type(frames: &[Vec<u8>], packet_type: u8) -> Vec<Vec<u8>> {
    frames
        .iter()
        .filter(|f| f.first().map(|b| b >> 4) == Some(packet_type >> 4))
        .cloned()
        .collect()
}
