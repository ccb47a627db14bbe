//! Overlay tunnel controller
//!
//! Brings a named-identity overlay client online inside the execution
//! environment and confirms the broker host is reachable through it
//! before any publish attempt proceeds. The controller owns the
//! forward-only state machine; the daemon itself sits behind the
//! injected [`TunnelClient`] capability so unit tests never spawn a
//! subprocess.
//!
//! State machine:
//! `NotStarted -> Starting -> SocketReady -> Authenticated -> RouteConfirmed`,
//! with any stage timing out into `Failed` carrying a stage-tagged
//! reason. Route confirmation is a heuristic: a peer whose overlay
//! address shares the broker's first IPv4 octet confirms the route,
//! any online peer is otherwise accepted as a readiness proxy, and
//! only "no online peers for the whole window" is a hard failure.

mod client;
mod status;


pub use client::{DaemonClient, TunnelClient};
pub use status::{PeerStatus, TunnelStatus};

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::OverlayConfig;
use crate::secrets::Secret;

/// Tunnel bring-up progress. Advances forward only; terminal states
/// are `RouteConfirmed` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    NotStarted,
    Starting,
    SocketReady,
    Authenticated,
    RouteConfirmed,
    Failed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::NotStarted => "not-started",
            TunnelState::Starting => "starting",
            TunnelState::SocketReady => "socket-ready",
            TunnelState::Authenticated => "authenticated",
            TunnelState::RouteConfirmed => "route-confirmed",
            TunnelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Stage-tagged bring-up failures
#[derive(Debug)]
pub enum TunnelError {
    /// The control socket never appeared
    SocketTimeout,
    /// The auth key is empty or still a placeholder; network auth was
    /// never attempted
    InvalidAuthKey,
    /// No usable peer route appeared within the deadline
    RouteTimeout,
    /// The daemon or its control binary failed
    Daemon(String),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelError::SocketTimeout => write!(f, "socket-timeout"),
            TunnelError::InvalidAuthKey => write!(f, "invalid-auth-key"),
            TunnelError::RouteTimeout => write!(f, "route-timeout"),
            TunnelError::Daemon(msg) => write!(f, "daemon: {}", msg),
        }
    }
}

impl std::error::Error for TunnelError {}

/// Drives a [`TunnelClient`] through the bring-up state machine.
pub struct TunnelController<C: TunnelClient> {
    client: C,
    config: OverlayConfig,
    state: TunnelState,
}

impl<C: TunnelClient> TunnelController<C> {
    pub fn new(client: C, config: OverlayConfig) -> Self {
        Self {
            client,
            config,
            state: TunnelState::NotStarted,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Bring the tunnel up and wait for a usable route to `broker_host`.
    ///
    /// A placeholder or empty auth key fails before the daemon is even
    /// started; the key cannot change mid-invocation, so bring-up
    /// retries never apply to it. Other failures are retried
    /// `bringup_attempts` times, each attempt restarting from the
    /// beginning.
    pub async fn bring_up(
        &mut self,
        auth_key: &Secret,
        broker_host: &str,
    ) -> Result<(), TunnelError> {
        if auth_key.value.is_empty() || auth_key.placeholder {
            self.state = TunnelState::Failed;
            return Err(TunnelError::InvalidAuthKey);
        }

        let attempts = self.config.bringup_attempts.max(1);
        let mut k = 1;
        loop {
            self.state = TunnelState::NotStarted;
            match self.try_bring_up(&auth_key.value, broker_host).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.state = TunnelState::Failed;
                    if k >= attempts {
                        return Err(e);
                    }
                    warn!(attempt = k, error = %e, "tunnel bring-up failed, restarting");
                    k += 1;
                }
            }
        }
    }

    async fn try_bring_up(&mut self, auth_key: &str, broker_host: &str) -> Result<(), TunnelError> {
        self.advance(TunnelState::Starting);
        self.client.start().await?;

        self.wait_for_socket().await?;
        self.advance(TunnelState::SocketReady);

        timeout(self.config.up_timeout, self.client.authenticate(auth_key))
            .await
            .map_err(|_| TunnelError::Daemon("up operation timed out".to_string()))??;
        self.advance(TunnelState::Authenticated);

        self.wait_for_route(broker_host).await?;
        self.advance(TunnelState::RouteConfirmed);
        Ok(())
    }

    fn advance(&mut self, next: TunnelState) {
        debug!(from = %self.state, to = %next, "tunnel state");
        self.state = next;
    }

    async fn wait_for_socket(&mut self) -> Result<(), TunnelError> {
        let deadline = Instant::now() + self.config.socket_timeout;
        loop {
            if self.client.is_socket_ready().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::SocketTimeout);
            }
            sleep(self.config.socket_interval).await;
        }
    }

    /// Poll the daemon's status view until a peer plausibly covering
    /// the broker host shows up, or any peer is online at all.
    async fn wait_for_route(&mut self, broker_host: &str) -> Result<(), TunnelError> {
        let cidr = self
            .config
            .overlay_cidr()
            .map_err(|e| TunnelError::Daemon(e.to_string()))?;
        let deadline = Instant::now() + self.config.route_timeout;

        loop {
            match self.client.peer_status().await {
                Ok(status) => {
                    let online: Vec<(&str, Ipv4Addr)> = status
                        .peers
                        .values()
                        .filter(|p| p.online)
                        .filter_map(|p| p.overlay_addr(&cidr).map(|a| (p.host_name.as_str(), a)))
                        .collect();

                    if let Some((name, addr)) = online
                        .iter()
                        .find(|(_, addr)| first_octet_match(broker_host, *addr))
                    {
                        info!(peer = name, addr = %addr, broker = broker_host, "peer route confirmed");
                        return Ok(());
                    }
                    if let Some((name, addr)) = online.first() {
                        // Peer-address correlation is best effort, not
                        // authoritative; an online peer is still a
                        // readiness signal.
                        warn!(
                            peer = name,
                            addr = %addr,
                            broker = broker_host,
                            "no peer address matches the broker host, accepting online peer as readiness proxy"
                        );
                        return Ok(());
                    }
                    debug!(backend = %status.backend_state, "no online peers yet");
                }
                Err(e) => debug!(error = %e, "status poll failed, will retry"),
            }

            if Instant::now() >= deadline {
                return Err(TunnelError::RouteTimeout);
            }
            sleep(self.config.route_interval).await;
        }
    }

    /// Point the environment's resolver at the configured DNS server.
    ///
    /// Process-wide side effect; re-applying the same override is a
    /// no-op. Returns whether the file was rewritten.
    pub async fn apply_dns_override(&self, server: &str) -> Result<bool, TunnelError> {
        apply_dns_override(Path::new(&self.config.resolv_conf), server)
            .await
            .map_err(|e| TunnelError::Daemon(format!("dns override: {}", e)))
    }
}

/// First-IPv4-octet heuristic for associating a peer's overlay address
/// with the broker host. A broker host that is not an IPv4 literal
/// never matches; the any-online-peer fallback covers it.
fn first_octet_match(broker_host: &str, peer_addr: Ipv4Addr) -> bool {
    broker_host
        .parse::<Ipv4Addr>()
        .map(|broker| broker.octets()[0] == peer_addr.octets()[0])
        .unwrap_or(false)
}

/// Idempotent resolver rewrite shared by the controller and tests.
async fn apply_dns_override(path: &Path, server: &str) -> std::io::Result<bool> {
    let wanted = format!("nameserver {}\n", server);
    match tokio::fs::read_to_string(path).await {
        Ok(existing) if existing == wanted => {
            debug!(server, path = %path.display(), "dns override already applied");
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::write(path, wanted.as_bytes()).await?;
    info!(server, path = %path.display(), "dns override applied");
    Ok(true)
}
