//! End-to-end tests for the Statecast bridge
//!
//! These tests run the whole driver against an in-test MQTT broker
//! (accept -> CONNACK -> collect PUBLISH -> PUBACK) and, for the relay
//! scenarios, an in-test SOCKS5 endpoint, validating the delivery
//! contract from inbound event to acknowledged message.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use statecast::config::{Config, RelayMode};
use statecast::driver::{run_bridge, AttemptError, BridgeError};
use statecast::event::InboundEvent;
use statecast::publisher::PublishError;
use statecast::secrets::{SecretStore, StaticStore};
use statecast::tunnel::{TunnelClient, TunnelError, TunnelStatus};

/// A message collected by the in-test broker
#[derive(Debug)]
struct Received {
    topic: String,
    payload: Vec<u8>,
}

/// Minimal in-test MQTT broker: accepts sessions, rejects the first
/// `reject_first` CONNECTs with the given CONNACK code, then collects
/// one QoS 1 PUBLISH per session and acknowledges it.
struct TestBroker {
    addr: SocketAddr,
    connects: Arc<AtomicU32>,
    received: mpsc::UnboundedReceiver<Received>,
}

impl TestBroker {
    async fn start(reject_first: u32, reject_code: u8) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connects = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        let counter = connects.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let code = if n < reject_first { reject_code } else { 0x00 };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = serve_session(stream, code, tx).await;
                });
            }
        });

        Self {
            addr,
            connects,
            received: rx,
        }
    }

    fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    async fn next_message(&mut self) -> Received {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("broker received no message in time")
            .expect("broker channel closed")
    }
}

/// One broker-side session: CONNECT in, CONNACK out, then PUBLISH in,
/// PUBACK out. Raw-byte parsing; the crate's client codec stays on the
/// client side of the wire.
async fn serve_session(
    mut stream: TcpStream,
    connack_code: u8,
    tx: mpsc::UnboundedSender<Received>,
) -> std::io::Result<()> {
    let (packet_type, _body) = read_packet(&mut stream).await?;
    assert_eq!(packet_type, 1, "expected CONNECT first");

    stream.write_all(&[0x20, 0x02, 0x00, connack_code]).await?;
    if connack_code != 0x00 {
        return Ok(());
    }

    loop {
        let (packet_type, body) = read_packet(&mut stream).await?;
        match packet_type {
            3 => {
                // PUBLISH: topic, packet id (QoS 1), payload
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
                let packet_id =
                    u16::from_be_bytes([body[2 + topic_len], body[3 + topic_len]]);
                let payload = body[4 + topic_len..].to_vec();
                let _ = tx.send(Received { topic, payload });
                stream
                    .write_all(&[0x40, 0x02, (packet_id >> 8) as u8, packet_id as u8])
                    .await?;
            }
            14 => return Ok(()), // DISCONNECT
            _ => {}
        }
    }
}

/// Read one packet: (type nibble, body)
async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;

    let mut remaining: usize = 0;
    let mut multiplier: usize = 1;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        remaining += (byte[0] & 0x7F) as usize * multiplier;
        if byte[0] & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }

    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await?;
    Ok((first[0] >> 4, body))
}

/// In-test SOCKS5 relay forwarding CONNECTs to wherever they ask for.
async fn start_socks5_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                stream.read_exact(&mut greeting).await.unwrap();
                let mut methods = vec![0u8; greeting[1] as usize];
                stream.read_exact(&mut methods).await.unwrap();
                stream.write_all(&[0x05, 0x00]).await.unwrap();

                let mut head = [0u8; 4];
                stream.read_exact(&mut head).await.unwrap();
                let host = match head[3] {
                    0x01 => {
                        let mut octets = [0u8; 4];
                        stream.read_exact(&mut octets).await.unwrap();
                        std::net::Ipv4Addr::from(octets).to_string()
                    }
                    0x03 => {
                        let mut len = [0u8; 1];
                        stream.read_exact(&mut len).await.unwrap();
                        let mut name = vec![0u8; len[0] as usize];
                        stream.read_exact(&mut name).await.unwrap();
                        String::from_utf8(name).unwrap()
                    }
                    other => panic!("unexpected address type {}", other),
                };
                let mut port_bytes = [0u8; 2];
                stream.read_exact(&mut port_bytes).await.unwrap();
                let port = u16::from_be_bytes(port_bytes);

                let mut upstream = TcpStream::connect((host.as_str(), port)).await.unwrap();
                stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            });
        }
    });

    addr
}

/// Scripted tunnel client for the overlay scenarios; counts calls so
/// tests can assert the controller never touched the network.
#[derive(Default)]
struct ScriptedTunnel {
    start_calls: Arc<AtomicU32>,
    auth_calls: Arc<AtomicU32>,
}

#[async_trait]
impl TunnelClient for ScriptedTunnel {
    async fn start(&mut self) -> Result<(), TunnelError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_socket_ready(&mut self) -> bool {
        true
    }

    async fn authenticate(&mut self, _auth_key: &str) -> Result<(), TunnelError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn peer_status(&mut self) -> Result<TunnelStatus, TunnelError> {
        TunnelStatus::from_json(
            r#"{
                "BackendState": "Running",
                "Peer": {
                    "nodekey:a": {
                        "HostName": "broker-host",
                        "TailscaleIPs": ["100.74.60.20"],
                        "Online": true
                    }
                }
            }"#,
        )
        .map_err(|e| TunnelError::Daemon(e.to_string()))
    }
}

fn base_config(broker: SocketAddr) -> Config {
    Config::parse(&format!(
        r#"
[broker]
host = "{}"
port = {}
topic = "pipelines/demo"
client_id = "statecast-e2e"
port_wait_timeout = "3s"
port_wait_interval = "100ms"
handshake_timeout = "2s"
ack_timeout = "2s"

[retry]
max_attempts = 3
backoff_base = "50ms"
"#,
        broker.ip(),
        broker.port()
    ))
    .unwrap()
}

fn demo_event() -> InboundEvent {
    InboundEvent::from_value(json!({
        "source": "aws.codepipeline",
        "detail-type": "CodePipeline Pipeline Execution State Change",
        "detail": { "pipeline": "Demo", "state": "SUCCEEDED" },
        "time": "2025-01-01T00:00:00Z"
    }))
}

fn empty_store() -> Arc<dyn SecretStore> {
    Arc::new(StaticStore::new())
}

#[tokio::test]
async fn direct_publish_delivers_the_exact_payload() {
    let mut broker = TestBroker::start(0, 0).await;
    let config = base_config(broker.addr);

    let delivery = run_bridge(&config, demo_event(), empty_store(), ScriptedTunnel::default())
        .await
        .unwrap();
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.subject, "Demo");
    assert_eq!(delivery.state, "SUCCEEDED");

    let message = broker.next_message().await;
    assert_eq!(message.topic, "pipelines/demo");

    let payload: Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(payload["eventSource"], "aws.codepipeline");
    assert_eq!(
        payload["detailType"],
        "CodePipeline Pipeline Execution State Change"
    );
    assert_eq!(payload["subject"], "Demo");
    assert_eq!(payload["state"], "SUCCEEDED");
    assert_eq!(payload["time"], "2025-01-01T00:00:00Z");
    assert_eq!(payload["raw"], *demo_event().raw());
}

#[tokio::test]
async fn missing_event_fields_publish_as_unknown() {
    let mut broker = TestBroker::start(0, 0).await;
    let config = base_config(broker.addr);
    let event = InboundEvent::from_value(json!({ "time": "2025-01-01T00:00:00Z" }));

    run_bridge(&config, event, empty_store(), ScriptedTunnel::default())
        .await
        .unwrap();

    let message = broker.next_message().await;
    let payload: Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(payload["eventSource"], "unknown");
    assert_eq!(payload["subject"], "unknown");
    assert_eq!(payload["state"], "unknown");
}

#[tokio::test]
async fn credentials_from_the_secret_store_reach_the_broker() {
    let mut broker = TestBroker::start(0, 0).await;
    let mut config = base_config(broker.addr);
    config.auth.enabled = true;
    config.auth.username_ref = "mqtt-username".to_string();
    config.auth.password_ref = "mqtt-password".to_string();

    let store: Arc<dyn SecretStore> = Arc::new(
        StaticStore::new()
            .with("mqtt-username", r#"{"value":"alice"}"#)
            .with("mqtt-password", "s3cret"),
    );

    run_bridge(&config, demo_event(), store, ScriptedTunnel::default())
        .await
        .unwrap();
    broker.next_message().await;
}

#[tokio::test]
async fn rejecting_broker_consumes_all_attempts() {
    let broker = TestBroker::start(u32::MAX, 0x05).await;
    let config = base_config(broker.addr);

    let err = run_bridge(&config, demo_event(), empty_store(), ScriptedTunnel::default())
        .await
        .unwrap_err();

    match err {
        BridgeError::Delivery(AttemptError::Publish(PublishError::AuthRejected(0x05))) => {}
        other => panic!("expected auth rejection, got {}", other),
    }
    assert_eq!(broker.connect_count(), 3);
}

#[tokio::test]
async fn broker_accepting_on_second_attempt_succeeds() {
    let mut broker = TestBroker::start(1, 0x03).await;
    let config = base_config(broker.addr);

    let delivery = run_bridge(&config, demo_event(), empty_store(), ScriptedTunnel::default())
        .await
        .unwrap();
    assert_eq!(delivery.attempts, 2);
    assert_eq!(broker.connect_count(), 2);
    broker.next_message().await;
}

#[tokio::test]
async fn port_never_opening_is_a_timeout_with_no_handshakes() {
    // Bind and drop so the port is known-closed.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = base_config(addr);
    config.broker.port_wait_timeout = Duration::from_millis(300);
    config.broker.port_wait_interval = Duration::from_millis(50);

    let err = run_bridge(&config, demo_event(), empty_store(), ScriptedTunnel::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, BridgeError::BrokerUnreachable(_)),
        "got {}",
        err
    );
}

#[tokio::test]
async fn placeholder_overlay_key_fails_fast_without_touching_the_broker() {
    let broker = TestBroker::start(0, 0).await;
    let mut config = base_config(broker.addr);
    config.overlay.enabled = true;
    config.overlay.auth_key_ref = "overlay-auth-key".to_string();

    let store: Arc<dyn SecretStore> = Arc::new(
        StaticStore::new().with("overlay-auth-key", r#"{"value":"REPLACE_WITH_OVERLAY_AUTH_KEY"}"#),
    );

    let tunnel = ScriptedTunnel::default();
    let auth_calls = tunnel.auth_calls.clone();
    let start_calls = tunnel.start_calls.clone();

    let err = run_bridge(&config, demo_event(), store, tunnel).await.unwrap_err();
    assert!(
        matches!(err, BridgeError::Tunnel(TunnelError::InvalidAuthKey)),
        "got {}",
        err
    );
    assert_eq!(auth_calls.load(Ordering::SeqCst), 0);
    assert_eq!(start_calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.connect_count(), 0);
}

#[tokio::test]
async fn overlay_happy_path_publishes_through_the_socks5_relay() {
    let mut broker = TestBroker::start(0, 0).await;
    let relay = start_socks5_relay().await;

    let mut config = base_config(broker.addr);
    config.overlay.enabled = true;
    config.overlay.auth_key_ref = "overlay-auth-key".to_string();
    config.overlay.socket_timeout = Duration::from_secs(1);
    config.overlay.route_timeout = Duration::from_secs(2);
    config.overlay.route_interval = Duration::from_millis(50);
    config.relay.mode = RelayMode::Socks5;
    config.relay.address = relay.to_string();
    config.relay.ready_timeout = Duration::from_secs(3);
    config.relay.ready_interval = Duration::from_millis(100);

    let store: Arc<dyn SecretStore> =
        Arc::new(StaticStore::new().with("overlay-auth-key", "tskey-test-123"));

    let tunnel = ScriptedTunnel::default();
    let auth_calls = tunnel.auth_calls.clone();

    let delivery = run_bridge(&config, demo_event(), store, tunnel).await.unwrap();
    assert_eq!(delivery.attempts, 1);
    assert_eq!(auth_calls.load(Ordering::SeqCst), 1);

    let message = broker.next_message().await;
    assert_eq!(message.topic, "pipelines/demo");
}

#[tokio::test]
async fn invalid_config_fails_before_any_network_action() {
    let broker = TestBroker::start(0, 0).await;
    let mut config = base_config(broker.addr);
    config.broker.topic = String::new();

    let err = run_bridge(&config, demo_event(), empty_store(), ScriptedTunnel::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Config(_)), "got {}", err);
    assert_eq!(broker.connect_count(), 0);
}
