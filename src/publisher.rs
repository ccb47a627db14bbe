//! Broker publisher
//!
//! One MQTT 3.1.1 session per call: CONNECT with optional credentials,
//! CONNACK, a single QoS 1 PUBLISH, the matching PUBACK, best-effort
//! DISCONNECT. The handshake and the acknowledgement each carry their
//! own deadline, independent of the retry budget one layer up. The
//! session runs over any byte stream, so the direct, relayed and mocked
//! transports share this code path.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::mqtt::{
    self, decode_response, encode_connect, encode_disconnect, encode_publish, Connect, Publish,
    Response, CONNACK_ACCEPTED, CONNACK_BAD_CREDENTIALS, CONNACK_NOT_AUTHORIZED,
};

/// Errors from one publish session. The caller decides retryability;
/// every variant here is retryable from its perspective.
#[derive(Debug)]
pub enum PublishError {
    /// CONNECT/CONNACK did not finish within the handshake deadline
    HandshakeTimeout,
    /// The broker rejected the credentials (CONNACK codes 4 and 5)
    AuthRejected(u8),
    /// The broker refused the CONNECT for another reason
    Handshake(String),
    /// The stream errored or closed mid-session
    TransportClosed(String),
    /// No PUBACK within the acknowledgement deadline
    AckTimeout,
    /// Outbound packet could not be encoded
    Encode(mqtt::EncodeError),
    /// Inbound bytes could not be decoded
    Decode(mqtt::DecodeError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::HandshakeTimeout => write!(f, "handshake-timeout"),
            PublishError::AuthRejected(code) => write!(f, "auth-rejected (CONNACK code {})", code),
            PublishError::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            PublishError::TransportClosed(msg) => write!(f, "transport-closed: {}", msg),
            PublishError::AckTimeout => write!(f, "ack-timeout"),
            PublishError::Encode(e) => write!(f, "encode error: {}", e),
            PublishError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<mqtt::EncodeError> for PublishError {
    fn from(e: mqtt::EncodeError) -> Self {
        PublishError::Encode(e)
    }
}

impl From<mqtt::DecodeError> for PublishError {
    fn from(e: mqtt::DecodeError) -> Self {
        PublishError::Decode(e)
    }
}

/// Broker credentials presented in the CONNECT
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }
}

/// Publishes exactly one message per session.
#[derive(Debug, Clone)]
pub struct Publisher {
    topic: String,
    client_id: String,
    keep_alive: u16,
    handshake_timeout: Duration,
    ack_timeout: Duration,
}

impl Publisher {
    pub fn new(
        topic: String,
        client_id: Option<String>,
        keep_alive: u16,
        handshake_timeout: Duration,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            topic,
            client_id: client_id.unwrap_or_else(default_client_id),
            keep_alive,
            handshake_timeout,
            ack_timeout,
        }
    }

    /// Run one session over the stream: handshake, publish, close.
    ///
    /// The stream is consumed; a failed session may have left it
    /// mid-handshake, so the caller reconnects for every attempt.
    pub async fn publish<S>(
        &self,
        mut stream: S,
        payload: Bytes,
        credentials: &Credentials,
    ) -> Result<(), PublishError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = Session {
            stream: &mut stream,
            read_buf: BytesMut::with_capacity(4096),
        };

        // CONNECT -> CONNACK, under the handshake deadline
        let connect = Connect {
            client_id: self.client_id.clone(),
            clean_session: true,
            keep_alive: self.keep_alive,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };
        let mut buf = BytesMut::new();
        encode_connect(&connect, &mut buf)?;

        timeout(self.handshake_timeout, session.handshake(&buf))
            .await
            .map_err(|_| PublishError::HandshakeTimeout)??;
        debug!(client_id = %self.client_id, anonymous = credentials.is_anonymous(), "broker session established");

        // PUBLISH QoS 1 -> PUBACK, under the acknowledgement deadline
        let publish = Publish {
            topic: self.topic.clone(),
            packet_id: 1,
            payload,
        };
        buf.clear();
        encode_publish(&publish, &mut buf)?;

        let result = timeout(self.ack_timeout, session.publish_and_await_ack(&buf, 1))
            .await
            .map_err(|_| PublishError::AckTimeout)
            .and_then(|r| r);

        // Close whether or not the send acknowledged
        buf.clear();
        encode_disconnect(&mut buf);
        if let Err(e) = stream.write_all(&buf).await {
            debug!(error = %e, "DISCONNECT write failed, ignoring");
        }
        let _ = stream.shutdown().await;

        result.map(|_| {
            debug!(topic = %self.topic, "publish acknowledged");
        })
    }
}

/// Default client id: statecast-<hostname>-<pid>
fn default_client_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("statecast-{}-{}", host, std::process::id())
}

struct Session<'a, S> {
    stream: &'a mut S,
    read_buf: BytesMut,
}

impl<S> Session<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn handshake(&mut self, connect_bytes: &[u8]) -> Result<(), PublishError> {
        self.stream
            .write_all(connect_bytes)
            .await
            .map_err(|e| PublishError::TransportClosed(e.to_string()))?;

        loop {
            match self.next_response().await? {
                Response::ConnAck { return_code, .. } => {
                    return match return_code {
                        CONNACK_ACCEPTED => Ok(()),
                        CONNACK_BAD_CREDENTIALS | CONNACK_NOT_AUTHORIZED => {
                            Err(PublishError::AuthRejected(return_code))
                        }
                        other => Err(PublishError::Handshake(format!(
                            "CONNACK return code {}",
                            other
                        ))),
                    };
                }
                Response::PubAck { packet_id } => {
                    return Err(PublishError::Handshake(format!(
                        "PUBACK {} before CONNACK",
                        packet_id
                    )))
                }
                Response::Other(packet_type) => {
                    warn!(packet_type, "unexpected packet before CONNACK, ignoring");
                }
            }
        }
    }

    async fn publish_and_await_ack(
        &mut self,
        publish_bytes: &[u8],
        packet_id: u16,
    ) -> Result<(), PublishError> {
        self.stream
            .write_all(publish_bytes)
            .await
            .map_err(|e| PublishError::TransportClosed(e.to_string()))?;

        loop {
            match self.next_response().await? {
                Response::PubAck { packet_id: id } if id == packet_id => return Ok(()),
                Response::PubAck { packet_id: id } => {
                    warn!(expected = packet_id, got = id, "PUBACK for unknown packet id, ignoring");
                }
                Response::ConnAck { .. } => {
                    return Err(PublishError::TransportClosed(
                        "duplicate CONNACK after session start".to_string(),
                    ))
                }
                Response::Other(packet_type) => {
                    debug!(packet_type, "ignoring packet while awaiting PUBACK");
                }
            }
        }
    }

    /// Read until one complete response is decodable.
    async fn next_response(&mut self) -> Result<Response, PublishError> {
        loop {
            if let Some((response, consumed)) = decode_response(&self.read_buf)? {
                let _ = self.read_buf.split_to(consumed);
                return Ok(response);
            }

            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| PublishError::TransportClosed(e.to_string()))?;
            if n == 0 {
                return Err(PublishError::TransportClosed(
                    "connection closed by broker".to_string(),
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn publisher() -> Publisher {
        Publisher::new(
            "pipelines/demo".to_string(),
            Some("statecast-test".to_string()),
            60,
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    fn connect_bytes(credentials: &Credentials) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_connect(
            &Connect {
                client_id: "statecast-test".to_string(),
                clean_session: true,
                keep_alive: 60,
                username: credentials.username.clone(),
                password: credentials.password.clone(),
            },
            &mut buf,
        )
        .unwrap();
        buf.to_vec()
    }

    fn publish_bytes(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_publish(
            &Publish {
                topic: "pipelines/demo".to_string(),
                packet_id: 1,
                payload: Bytes::copy_from_slice(payload),
            },
            &mut buf,
        )
        .unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn happy_path_session() {
        let credentials = Credentials::default();
        let stream = Builder::new()
            .write(&connect_bytes(&credentials))
            .read(&[0x20, 0x02, 0x00, 0x00]) // CONNACK accepted
            .write(&publish_bytes(b"{}"))
            .read(&[0x40, 0x02, 0x00, 0x01]) // PUBACK id 1
            .write(&[0xE0, 0x00]) // DISCONNECT
            .build();

        publisher()
            .publish(stream, Bytes::from_static(b"{}"), &credentials)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn credentials_ride_in_the_connect() {
        let credentials = Credentials {
            username: Some("alice".to_string()),
            password: Some("s3cret".to_string()),
        };
        let stream = Builder::new()
            .write(&connect_bytes(&credentials))
            .read(&[0x20, 0x02, 0x00, 0x00])
            .write(&publish_bytes(b"x"))
            .read(&[0x40, 0x02, 0x00, 0x01])
            .write(&[0xE0, 0x00])
            .build();

        publisher()
            .publish(stream, Bytes::from_static(b"x"), &credentials)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connack_not_authorized_is_auth_rejected() {
        let credentials = Credentials::default();
        let stream = Builder::new()
            .write(&connect_bytes(&credentials))
            .read(&[0x20, 0x02, 0x00, 0x05])
            .build();

        let err = publisher()
            .publish(stream, Bytes::from_static(b"{}"), &credentials)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::AuthRejected(0x05)), "got {}", err);
    }

    #[tokio::test]
    async fn missing_connack_is_handshake_timeout() {
        let credentials = Credentials::default();
        let stream = Builder::new()
            .write(&connect_bytes(&credentials))
            .wait(Duration::from_secs(2))
            .build();

        let err = publisher()
            .publish(stream, Bytes::from_static(b"{}"), &credentials)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::HandshakeTimeout), "got {}", err);
    }

    #[tokio::test]
    async fn missing_puback_is_ack_timeout() {
        let credentials = Credentials::default();
        let stream = Builder::new()
            .write(&connect_bytes(&credentials))
            .read(&[0x20, 0x02, 0x00, 0x00])
            .write(&publish_bytes(b"{}"))
            .wait(Duration::from_secs(2))
            .write(&[0xE0, 0x00])
            .build();

        let err = publisher()
            .publish(stream, Bytes::from_static(b"{}"), &credentials)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::AckTimeout), "got {}", err);
    }

    #[tokio::test]
    async fn early_eof_is_transport_closed() {
        let credentials = Credentials::default();
        let stream = Builder::new().write(&connect_bytes(&credentials)).build();

        let err = publisher()
            .publish(stream, Bytes::from_static(b"{}"), &credentials)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::TransportClosed(_)), "got {}", err);
    }

    #[tokio::test]
    async fn split_connack_across_reads_is_reassembled() {
        let credentials = Credentials::default();
        let stream = Builder::new()
            .write(&connect_bytes(&credentials))
            .read(&[0x20, 0x02])
            .read(&[0x00, 0x00])
            .write(&publish_bytes(b"{}"))
            .read(&[0x40, 0x02, 0x00, 0x01])
            .write(&[0xE0, 0x00])
            .build();

        publisher()
            .publish(stream, Bytes::from_static(b"{}"), &credentials)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn puback_for_wrong_id_keeps_waiting_for_the_right_one() {
        let credentials = Credentials::default();
        let stream = Builder::new()
            .write(&connect_bytes(&credentials))
            .read(&[0x20, 0x02, 0x00, 0x00])
            .write(&publish_bytes(b"{}"))
            .read(&[0x40, 0x02, 0x00, 0x09]) // PUBACK id 9, not ours
            .read(&[0x40, 0x02, 0x00, 0x01]) // then ours
            .write(&[0xE0, 0x00])
            .build();

        publisher()
            .publish(stream, Bytes::from_static(b"{}"), &credentials)
            .await
            .unwrap();
    }

    #[test]
    fn default_client_id_is_namespaced() {
        let id = default_client_id();
        assert!(id.starts_with("statecast-"));
        assert!(id.ends_with(&std::process::id().to_string()));
    }
}
