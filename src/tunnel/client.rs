//! Tunnel client capability
//!
//! The controller drives the overlay network through this trait; the
//! production implementation shells out to an external daemon and its
//! control binary, the test double progresses through a scripted state
//! sequence with no subprocess.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{TunnelError, TunnelStatus};
use crate::config::OverlayConfig;

/// Operations the controller needs from the overlay client
#[async_trait]
pub trait TunnelClient: Send {
    /// Start or attach to the background daemon
    async fn start(&mut self) -> Result<(), TunnelError>;

    /// Whether the local control endpoint exists yet
    async fn is_socket_ready(&mut self) -> bool;

    /// Run the daemon's "come up" operation with the auth key
    async fn authenticate(&mut self, auth_key: &str) -> Result<(), TunnelError>;

    /// The daemon's current peer status view
    async fn peer_status(&mut self) -> Result<TunnelStatus, TunnelError>;
}

/// Production client over an external overlay daemon.
///
/// Spawns the daemon with userspace networking and a local SOCKS5
/// listener, or attaches when a previous warm invocation left the
/// control socket behind. The spawned child is killed on drop unless
/// `leave_running` keeps the daemon warm for the next invocation.
pub struct DaemonClient {
    config: OverlayConfig,
    child: Option<Child>,
}

impl DaemonClient {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    /// Run the companion control binary against the daemon socket.
    async fn control(&self, args: &[&str]) -> Result<String, TunnelError> {
        let output = Command::new(&self.config.control_bin)
            .arg("--socket")
            .arg(&self.config.socket_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TunnelError::Daemon(format!("{}: {}", self.config.control_bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::Daemon(format!(
                "{} {} exited with {}: {}",
                self.config.control_bin,
                args.first().unwrap_or(&""),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TunnelClient for DaemonClient {
    async fn start(&mut self) -> Result<(), TunnelError> {
        let socket = Path::new(&self.config.socket_path);
        if socket.exists() {
            // A warm invocation left the daemon running; attach to it.
            info!(socket = %socket.display(), "attaching to running overlay daemon");
            return Ok(());
        }

        if let Some(parent) = Path::new(&self.config.state_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TunnelError::Daemon(format!("state dir: {}", e)))?;
        }

        let child = Command::new(&self.config.daemon_bin)
            .arg("--state")
            .arg(&self.config.state_path)
            .arg("--socket")
            .arg(&self.config.socket_path)
            .arg("--tun=userspace-networking")
            .arg(format!("--socks5-server={}", self.config.socks5_listen))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(!self.config.leave_running)
            .spawn()
            .map_err(|e| TunnelError::Daemon(format!("{}: {}", self.config.daemon_bin, e)))?;

        debug!(daemon = %self.config.daemon_bin, pid = child.id(), "overlay daemon spawned");
        self.child = Some(child);
        Ok(())
    }

    async fn is_socket_ready(&mut self) -> bool {
        tokio::fs::metadata(&self.config.socket_path).await.is_ok()
    }

    async fn authenticate(&mut self, auth_key: &str) -> Result<(), TunnelError> {
        self.control(&["up", "--authkey", auth_key]).await?;
        info!("overlay daemon authenticated");
        Ok(())
    }

    async fn peer_status(&mut self) -> Result<TunnelStatus, TunnelError> {
        let json = self.control(&["status", "--json"]).await?;
        TunnelStatus::from_json(&json)
            .map_err(|e| TunnelError::Daemon(format!("status parse: {}", e)))
    }
}
