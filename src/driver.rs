//! Invocation driver
//!
//! Sequences the whole bridge: validate configuration, build the
//! payload, bring the tunnel up (with broker-credential resolution
//! racing it), confirm port readiness, then drive the retry loop over
//! {relay connect -> broker publish}. Each failure is tagged with the
//! stage it happened in so the exit log names both stage and reason.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{Config, ConfigError, RelayMode, SecretBackend};
use crate::event::{InboundEvent, OutboundPayload};
use crate::publisher::{Credentials, PublishError, Publisher};
use crate::readiness::{wait_for_port, ReadinessError};
use crate::relay::{RelayConnector, RelayError};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::secrets::{
    DirStore, EnvStore, Secret, SecretError, SecretKind, SecretResolver, SecretStore,
};
use crate::tunnel::{DaemonClient, TunnelClient, TunnelController, TunnelError};

/// One publish attempt's failure: the relay connect or the broker
/// session. Both are retryable.
#[derive(Debug)]
pub enum AttemptError {
    Relay(RelayError),
    Publish(PublishError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Relay(e) => write!(f, "relay: {}", e),
            AttemptError::Publish(e) => write!(f, "publish: {}", e),
        }
    }
}

impl std::error::Error for AttemptError {}

/// Stage-tagged invocation failure
#[derive(Debug)]
pub enum BridgeError {
    Config(ConfigError),
    Secret(SecretError),
    Tunnel(TunnelError),
    /// The broker port never accepted connections (direct mode)
    BrokerUnreachable(ReadinessError),
    /// The local relay port never accepted connections (SOCKS5 mode)
    RelayUnavailable(ReadinessError),
    /// All publish attempts exhausted; carries the final attempt's
    /// error unchanged
    Delivery(AttemptError),
    /// The inbound event was not valid JSON
    Event(serde_json::Error),
}

impl BridgeError {
    /// The stage that failed, for the exit log
    pub fn stage(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "config",
            BridgeError::Secret(_) => "secrets",
            BridgeError::Tunnel(_) => "tunnel",
            BridgeError::BrokerUnreachable(_) => "broker-port-wait",
            BridgeError::RelayUnavailable(_) => "relay-port-wait",
            BridgeError::Delivery(_) => "delivery",
            BridgeError::Event(_) => "event",
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Config(e) => write!(f, "config: {}", e),
            BridgeError::Secret(e) => write!(f, "secrets: {}", e),
            BridgeError::Tunnel(e) => write!(f, "tunnel: {}", e),
            BridgeError::BrokerUnreachable(e) => write!(f, "broker-port-wait: {}", e),
            BridgeError::RelayUnavailable(e) => write!(f, "relay-port-wait: {}", e),
            BridgeError::Delivery(e) => write!(f, "delivery: {}", e),
            BridgeError::Event(e) => write!(f, "event: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Config(e)
    }
}

impl From<SecretError> for BridgeError {
    fn from(e: SecretError) -> Self {
        BridgeError::Secret(e)
    }
}

impl From<TunnelError> for BridgeError {
    fn from(e: TunnelError) -> Self {
        BridgeError::Tunnel(e)
    }
}

/// Summary of a successful invocation
#[derive(Debug)]
pub struct Delivery {
    pub topic: String,
    pub subject: String,
    pub state: String,
    pub attempts: u32,
}

/// Run the bridge with production collaborators: the secret store
/// selected by configuration and the external overlay daemon.
pub async fn run(config: &Config, event: InboundEvent) -> Result<Delivery, BridgeError> {
    let store: Arc<dyn SecretStore> = match config.secrets.backend {
        SecretBackend::Env => Arc::new(EnvStore),
        SecretBackend::File => Arc::new(DirStore::new(config.secrets.dir.clone())),
    };
    let tunnel_client = DaemonClient::new(config.overlay.clone());
    run_bridge(config, event, store, tunnel_client).await
}

/// Run the bridge with injected collaborators.
pub async fn run_bridge<C: TunnelClient>(
    config: &Config,
    event: InboundEvent,
    store: Arc<dyn SecretStore>,
    tunnel_client: C,
) -> Result<Delivery, BridgeError> {
    // Fail fast before any network action.
    config.validate()?;

    // The payload is built exactly once, up front.
    let payload = OutboundPayload::from_event(&event);
    let payload_bytes = payload.to_bytes().map_err(BridgeError::Event)?;
    debug!(subject = %payload.subject, state = %payload.state, "payload built");

    let resolver = SecretResolver::new(store);

    // Tunnel bring-up and broker-credential resolution share no state;
    // both must finish before the first handshake. A tunnel failure
    // takes precedence in reporting.
    let credentials = if config.overlay.enabled {
        let auth_key = resolve_auth_key(&resolver, config).await?;
        let mut controller = TunnelController::new(tunnel_client, config.overlay.clone());
        let (tunnel_result, creds_result) = tokio::join!(
            controller.bring_up(&auth_key, &config.broker.host),
            resolve_credentials(&resolver, config),
        );
        tunnel_result?;
        if let Some(dns) = &config.broker.dns_override {
            controller.apply_dns_override(dns).await?;
        }
        creds_result?
    } else {
        resolve_credentials(&resolver, config).await?
    };

    // Port readiness: the broker directly, or the local relay port.
    let connector = match config.relay.mode {
        RelayMode::Direct => {
            wait_for_port(
                &config.broker.host,
                config.broker.port,
                config.broker.port_wait_timeout,
                config.broker.port_wait_interval,
            )
            .await
            .map_err(BridgeError::BrokerUnreachable)?;
            RelayConnector::direct(config.relay.connect_timeout)
        }
        RelayMode::Socks5 => {
            let relay_addr = config.relay.relay_addr()?;
            wait_for_port(
                &relay_addr.ip().to_string(),
                relay_addr.port(),
                config.relay.ready_timeout,
                config.relay.ready_interval,
            )
            .await
            .map_err(BridgeError::RelayUnavailable)?;
            RelayConnector::socks5(relay_addr, config.relay.connect_timeout)
        }
    };

    let publisher = Publisher::new(
        config.broker.topic.clone(),
        config.broker.client_id.clone(),
        config.broker.keep_alive,
        config.broker.handshake_timeout,
        config.broker.ack_timeout,
    );
    let policy = RetryPolicy::new(config.retry.max_attempts, config.retry.backoff_base);

    // Every attempt reconnects and re-runs the handshake from scratch.
    let attempts_made = std::sync::atomic::AtomicU32::new(0);
    run_with_retry(policy, |k| {
        attempts_made.store(k, std::sync::atomic::Ordering::SeqCst);
        let connector = connector.clone();
        let publisher = publisher.clone();
        let payload_bytes = payload_bytes.clone();
        let credentials = credentials.clone();
        let host = config.broker.host.clone();
        let port = config.broker.port;
        async move {
            let stream = connector
                .connect(&host, port)
                .await
                .map_err(AttemptError::Relay)?;
            publisher
                .publish(stream, payload_bytes, &credentials)
                .await
                .map_err(AttemptError::Publish)
        }
    })
    .await
    .map_err(BridgeError::Delivery)?;

    let attempts = attempts_made.load(std::sync::atomic::Ordering::SeqCst);
    info!(
        topic = %config.broker.topic,
        subject = %payload.subject,
        state = %payload.state,
        attempts,
        "event delivered"
    );
    Ok(Delivery {
        topic: config.broker.topic.clone(),
        subject: payload.subject.clone(),
        state: payload.state.clone(),
        attempts,
    })
}

/// The overlay auth key; a missing secret behind a configured
/// reference is treated as an invalid key rather than a silent skip.
async fn resolve_auth_key(
    resolver: &SecretResolver,
    config: &Config,
) -> Result<Secret, BridgeError> {
    match resolver
        .resolve(SecretKind::OverlayAuthKey, &config.overlay.auth_key_ref)
        .await?
    {
        Some(secret) => Ok(secret),
        None => Err(BridgeError::Tunnel(TunnelError::InvalidAuthKey)),
    }
}

/// Broker credentials, resolved concurrently. Placeholder values warn
/// inside the resolver and ride along; the broker will reject them as
/// auth-rejected, which is the outcome we want surfaced.
async fn resolve_credentials(
    resolver: &SecretResolver,
    config: &Config,
) -> Result<Credentials, BridgeError> {
    if !config.auth.enabled {
        return Ok(Credentials::default());
    }

    let (username, password) = tokio::join!(
        resolver.resolve(SecretKind::BrokerUsername, &config.auth.username_ref),
        resolver.resolve(SecretKind::BrokerPassword, &config.auth.password_ref),
    );

    Ok(Credentials {
        username: username?.map(|s| s.value),
        password: password?.map(|s| s.value),
    })
}
