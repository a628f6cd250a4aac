//! Engine scenarios against an in-memory transport.
//!
//! All tests run on paused tokio time, so settle delays, probe timeouts and
//! reconnect delays elapse instantly once every task is idle.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{frames_of_type, parse_publish, parse_subscribe_topic, Behavior, FakeTransport};
use tokio::time::{sleep, Instant};
use wsmqtt::mqtt::TransportEvent;
use wsmqtt::{
    ClientSettings, ConfigStore, ConnectRequest, ConnectReturnCode, ConnectionState,
    ListenerId, MemoryConfigStore, MqttError, MqttHandle, QoS,
};

const BROKER_URL: &str = "ws://broker.test:8080/mqtt";

fn spawn_client(fake: &FakeTransport) -> (MqttHandle, Arc<MemoryConfigStore>) {
    spawn_with(fake, ClientSettings::default())
}

fn spawn_with(
    fake: &FakeTransport,
    settings: ClientSettings,
) -> (MqttHandle, Arc<MemoryConfigStore>) {
    let store = Arc::new(MemoryConfigStore::default());
    let client = MqttHandle::spawn(settings, Arc::new(fake.clone()), store.clone());
    (client, store)
}

fn record_errors(client: &MqttHandle) -> Arc<Mutex<Vec<(String, String)>>> {
    let errors: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
    let sink = errors.clone();
    client.set_error_listener(move |message, title| {
        sink.lock()
            .unwrap()
            .push((message.to_string(), title.to_string()));
    });
    errors
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

fn broker() -> ConnectRequest {
    ConnectRequest::new("broker.test", 8080).client_id("c1")
}

#[tokio::test(start_paused = true)]
async fn connects_on_ws_mqtt_and_publishes_a_single_frame() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, store) = spawn_client(&fake);

    client
        .connect(ConnectRequest::new("broker.test", 8080))
        .await
        .unwrap();

    let status = client.status().await.unwrap();
    assert!(status.connected);
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(fake.opened_urls(), vec![BROKER_URL]);
    assert_eq!(fake.protocols(), vec!["mqtt"]);
    assert_eq!(store.load_config(), status.config);

    client.publish("t", "v", QoS::AtMostOnce).await.unwrap();

    let sent = fake.sent_last();
    assert_eq!(sent[0][0], 0x10, "CONNECT goes out first");
    let publishes = frames_of_type(&sent, 0x30);
    assert_eq!(publishes.len(), 1);
    assert_eq!(
        parse_publish(&publishes[0]),
        ("t".to_string(), b"v".to_vec(), None)
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_probe() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);

    let (first, second) = tokio::join!(
        client.connect(broker()),
        client.connect(ConnectRequest::new("elsewhere.test", 1883))
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(fake.opened_urls(), vec![BROKER_URL]);

    // Already connected: resolves without touching the transport.
    client.connect(broker()).await.unwrap();
    assert_eq!(fake.opened_urls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn operations_fail_fast_while_disconnected() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);

    assert_eq!(
        client.publish("t", "v", QoS::AtMostOnce).await,
        Err(MqttError::NotConnected)
    );
    assert_eq!(
        client.subscribe("t", QoS::AtMostOnce).await,
        Err(MqttError::NotConnected)
    );
    assert_eq!(client.unsubscribe("t").await, Err(MqttError::NotConnected));
    assert_eq!(
        client.test_connection().await,
        Err(MqttError::NotConnected)
    );
    assert!(fake.opened_urls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_candidate_times_out_and_stale_events_are_ignored() {
    let fake = FakeTransport::new(|url| {
        if url.ends_with("/mqtt") {
            Behavior::Hang
        } else if url.ends_with("/ws") {
            Behavior::Accept(0)
        } else {
            Behavior::Refuse
        }
    });
    let (client, _) = spawn_client(&fake);

    let start = Instant::now();
    client.connect(broker()).await.unwrap();
    // first-candidate timeout + debounce + settle
    assert!(start.elapsed() >= Duration::from_millis(5_300));
    assert_eq!(
        fake.opened_urls(),
        vec![BROKER_URL, "ws://broker.test:8080/ws"]
    );

    // The abandoned link wakes up late; none of it may reach the session.
    fake.emit(0, TransportEvent::Open);
    fake.emit(0, TransportEvent::Message(vec![0x20, 0x02, 0x00, 0x05]));
    fake.emit(0, TransportEvent::Close(Some(1006)));
    settle().await;

    let status = client.status().await.unwrap();
    assert!(status.connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(fake.opened_urls().len(), 2);
    assert!(fake.sent(0).is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejection_advances_to_the_next_candidate() {
    let fake = FakeTransport::new(|url| {
        if url.ends_with("/mqtt") {
            Behavior::Accept(5)
        } else {
            Behavior::Accept(0)
        }
    });
    let (client, _) = spawn_client(&fake);

    client.connect(broker()).await.unwrap();
    assert_eq!(
        fake.opened_urls(),
        vec![BROKER_URL, "ws://broker.test:8080/ws"]
    );
}

#[tokio::test(start_paused = true)]
async fn rejection_aborts_when_configured() {
    let fake = FakeTransport::new(|_| Behavior::Accept(5));
    let settings = ClientSettings {
        abort_on_rejection: true,
        ..ClientSettings::default()
    };
    let (client, _) = spawn_with(&fake, settings);
    let errors = record_errors(&client);

    assert_eq!(
        client.connect(broker()).await,
        Err(MqttError::ConnectionRefused(ConnectReturnCode::NotAuthorized))
    );
    assert_eq!(fake.opened_urls().len(), 1);
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_candidates_report_attempt_count_once() {
    let fake = FakeTransport::new(|_| Behavior::Refuse);
    let (client, store) = spawn_client(&fake);
    let errors = record_errors(&client);

    let result = client
        .connect(ConnectRequest::new("broker.test", 1883))
        .await;
    match result {
        Err(MqttError::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        fake.opened_urls(),
        vec![
            "ws://broker.test:1883/mqtt",
            "ws://broker.test:1883",
            "ws://broker.test:1883/ws",
        ]
    );

    let errors = errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1, "Connection failed");
    assert!(errors[0].0.contains("3 attempts"));

    let status = client.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.config, None);
    assert_eq!(store.load_config(), None);
}

#[tokio::test(start_paused = true)]
async fn reconnection_gives_up_after_three_attempts() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    let errors = record_errors(&client);
    client.connect(broker()).await.unwrap();

    fake.set_behavior(|_| Behavior::Refuse);
    fake.drop_link();
    settle().await;

    let status = client.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Reconnecting);
    assert_eq!(status.reconnect_attempts, 1);
    assert!(status.config.is_some());

    sleep(Duration::from_secs(120)).await;

    // one initial link, then three cycles over the four candidates of port 8080
    assert_eq!(fake.opened_urls().len(), 1 + 3 * 4);
    let errors_seen = errors.lock().unwrap().clone();
    assert_eq!(errors_seen.len(), 1);
    assert_eq!(errors_seen[0].1, "Connection lost");

    let status = client.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.config, None);

    sleep(Duration::from_secs(600)).await;
    assert_eq!(fake.opened_urls().len(), 13);
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resubscribes_in_insertion_order() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();
    for topic in ["a/1", "b/2", "c/3"] {
        client.subscribe(topic, QoS::AtMostOnce).await.unwrap();
    }
    client.subscribe("b/2", QoS::AtLeastOnce).await.unwrap();

    fake.drop_link();
    sleep(Duration::from_secs(10)).await;

    let status = client.status().await.unwrap();
    assert!(status.connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.subscriptions, vec!["a/1", "b/2", "c/3"]);
    assert_eq!(fake.opened_urls().len(), 2);

    let sent = fake.sent_last();
    assert_eq!(sent[0][0], 0x10);
    let topics: Vec<String> = frames_of_type(&sent, 0x82)
        .iter()
        .map(|f| parse_subscribe_topic(f))
        .collect();
    assert_eq!(topics, vec!["a/1", "b/2", "c/3"]);
}

#[tokio::test(start_paused = true)]
async fn disconnect_then_reconnect_uses_saved_config() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, store) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();
    client.subscribe("keep/me", QoS::AtMostOnce).await.unwrap();

    client.disconnect().await.unwrap();
    assert_eq!(fake.sent_last().last().unwrap(), &vec![0xE0, 0x00]);

    let status = client.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.config, None);
    assert_eq!(status.subscriptions, vec!["keep/me"]);
    assert_eq!(store.load_config().unwrap().client_id, "c1");

    // No automatic reconnection after a user disconnect.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(fake.opened_urls().len(), 1);

    client.reconnect().await.unwrap();
    let status = client.status().await.unwrap();
    assert!(status.connected);
    assert_eq!(status.config.unwrap().client_id, "c1");
    let topics: Vec<String> = frames_of_type(&fake.sent_last(), 0x82)
        .iter()
        .map(|f| parse_subscribe_topic(f))
        .collect();
    assert_eq!(topics, vec!["keep/me"]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_without_any_config_fails() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    assert_eq!(client.reconnect().await, Err(MqttError::NoBrokerConfig));
}

#[tokio::test(start_paused = true)]
async fn qos1_publish_resolves_on_puback_or_after_grace() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();

    let publisher = client.clone();
    let pending =
        tokio::spawn(async move { publisher.publish("q", "1", QoS::AtLeastOnce).await });
    settle().await;

    let publishes = frames_of_type(&fake.sent_last(), 0x30);
    let (topic, payload, packet_id) = parse_publish(&publishes[0]);
    assert_eq!((topic.as_str(), payload.as_slice()), ("q", b"1".as_slice()));
    let [hi, lo] = packet_id.unwrap().to_be_bytes();

    let start = Instant::now();
    fake.inject(vec![0x40, 0x02, hi, lo]);
    pending.await.unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));

    let start = Instant::now();
    client.publish("q", "2", QoS::AtLeastOnce).await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn connection_loss_fails_outstanding_publishes() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();

    let publisher = client.clone();
    let pending =
        tokio::spawn(async move { publisher.publish("q", "1", QoS::AtLeastOnce).await });
    settle().await;
    fake.drop_link();

    assert_eq!(pending.await.unwrap(), Err(MqttError::ConnectionLost));
}

#[tokio::test(start_paused = true)]
async fn inbound_messages_fan_out_and_listeners_can_leave() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let own_id: Arc<Mutex<Option<ListenerId>>> = Arc::default();

    let (log, slot, registry) = (seen.clone(), own_id.clone(), client.clone());
    let once = client.add_message_listener(move |msg| {
        log.lock().unwrap().push(format!("once:{}", msg.payload_str()));
        if let Some(id) = *slot.lock().unwrap() {
            registry.remove_message_listener(id);
        }
    });
    *own_id.lock().unwrap() = Some(once);

    let log = seen.clone();
    client.add_message_listener(move |msg| {
        log.lock()
            .unwrap()
            .push(format!("{}:{}", msg.topic, msg.payload_str()));
    });
    let mut channel = client.message_channel(8);

    // QoS 1 PUBLISH, packet id 7
    fake.inject(vec![
        0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07, b'h', b'i',
    ]);
    // QoS 0 PUBLISH split across two transport messages
    fake.inject(vec![0x30, 0x07, 0x00, 0x03]);
    fake.inject(vec![b'a', b'/', b'b', b'y', b'o']);
    settle().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["once:hi", "a/b:hi", "a/b:yo"]
    );
    assert_eq!(
        frames_of_type(&fake.sent_last(), 0x40),
        vec![vec![0x40, 0x02, 0x00, 0x07]]
    );

    let first = channel.recv().await.unwrap();
    assert_eq!((first.qos, first.payload_str().as_ref()), (1, "hi"));
    assert_eq!(channel.recv().await.unwrap().payload_str(), "yo");

    // The self-removing listener released its handle clone, so this is the last one.
    drop(client);
    settle().await;
    assert_eq!(fake.sent_last().last().unwrap(), &vec![0xE0, 0x00]);
}

#[tokio::test(start_paused = true)]
async fn refused_subscription_is_forgotten() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();
    client.subscribe("secret/#", QoS::AtMostOnce).await.unwrap();
    client.subscribe("open/#", QoS::AtMostOnce).await.unwrap();

    let subscribe = frames_of_type(&fake.sent_last(), 0x82)[0].clone();
    fake.inject(vec![0x90, 0x03, subscribe[2], subscribe[3], 0x80]);
    settle().await;

    let status = client.status().await.unwrap();
    assert_eq!(status.subscriptions, vec!["open/#"]);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_pings_every_thirty_seconds() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();

    sleep(Duration::from_secs(61)).await;
    let pings = frames_of_type(&fake.sent_last(), 0xC0);
    assert_eq!(pings, vec![vec![0xC0, 0x00], vec![0xC0, 0x00]]);

    client.disconnect().await.unwrap();
    sleep(Duration::from_secs(120)).await;
    assert_eq!(frames_of_type(&fake.sent_last(), 0xC0).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connection_publishes_json() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();

    let payload = client.test_connection().await.unwrap();
    let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(json["client_id"], "c1");

    let publishes = frames_of_type(&fake.sent_last(), 0x30);
    let (topic, body, _) = parse_publish(&publishes[0]);
    assert_eq!(topic, "test/connection");
    assert_eq!(body, payload.into_bytes());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_disconnects() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();

    drop(client);
    settle().await;
    assert_eq!(fake.sent_last().last().unwrap(), &vec![0xE0, 0x00]);
}

#[tokio::test(start_paused = true)]
async fn candidate_without_connack_times_out() {
    let fake = FakeTransport::new(|url| {
        if url.ends_with("/mqtt") {
            Behavior::OpenSilent
        } else if url.ends_with("/ws") {
            Behavior::Accept(0)
        } else {
            Behavior::Refuse
        }
    });
    let (client, _) = spawn_client(&fake);

    let start = Instant::now();
    client.connect(broker()).await.unwrap();
    // first-candidate timeout + debounce + settle
    assert!(start.elapsed() >= Duration::from_millis(5_300));
    assert_eq!(
        fake.opened_urls(),
        vec![BROKER_URL, "ws://broker.test:8080/ws"]
    );
    let first = fake.sent(0);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0][0], 0x10, "CONNECT reached the silent broker");

    // A late CONNACK on the abandoned link changes nothing.
    fake.emit(0, TransportEvent::Message(vec![0x20, 0x02, 0x00, 0x00]));
    settle().await;
    assert!(client.status().await.unwrap().connected);
    assert_eq!(fake.opened_urls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_reconnecting_cancels_the_pending_attempt() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    let errors = record_errors(&client);
    client.connect(broker()).await.unwrap();

    fake.drop_link();
    settle().await;
    assert_eq!(
        client.status().await.unwrap().state,
        ConnectionState::Reconnecting
    );

    client.disconnect().await.unwrap();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(fake.opened_urls().len(), 1);
    let status = client.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, 0);
    assert!(errors.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fresh_connect_starts_without_subscriptions() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let (client, _) = spawn_client(&fake);
    client.connect(broker()).await.unwrap();
    client.subscribe("x/1", QoS::AtMostOnce).await.unwrap();
    client.disconnect().await.unwrap();

    client.connect(broker()).await.unwrap();
    let status = client.status().await.unwrap();
    assert!(status.subscriptions.is_empty());
    assert!(frames_of_type(&fake.sent_last(), 0x82).is_empty());

    // Nor does the automatic reconnect bring the old topic back.
    fake.drop_link();
    sleep(Duration::from_secs(10)).await;
    assert!(client.status().await.unwrap().connected);
    assert_eq!(fake.opened_urls().len(), 3);
    assert!(frames_of_type(&fake.sent_last(), 0x82).is_empty());
}

#[tokio::test(start_paused = true)]
async fn oversized_inbound_packet_drops_the_link() {
    let fake = FakeTransport::accepting(BROKER_URL);
    let settings = ClientSettings {
        max_packet_size: 1024,
        ..ClientSettings::default()
    };
    let (client, _) = spawn_with(&fake, settings);
    let received: Arc<Mutex<Vec<String>>> = Arc::default();
    let log = received.clone();
    client.add_message_listener(move |msg| log.lock().unwrap().push(msg.topic.clone()));
    client.connect(broker()).await.unwrap();

    // PUBLISH announcing 4096 bytes
    fake.inject(vec![0x30, 0x80, 0x20, 0x00, 0x01, b'a']);
    settle().await;
    assert_eq!(
        client.status().await.unwrap().state,
        ConnectionState::Reconnecting
    );

    sleep(Duration::from_secs(10)).await;
    assert!(client.status().await.unwrap().connected);
    assert_eq!(fake.opened_urls().len(), 2);

    // The new link starts from an empty buffer.
    fake.inject(vec![0x30, 0x05, 0x00, 0x01, b'b', b'o', b'k']);
    settle().await;
    assert_eq!(*received.lock().unwrap(), vec!["b"]);
}
