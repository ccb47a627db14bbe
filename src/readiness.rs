//! TCP port readiness
//!
//! The broker and the local relay both come up behind warm-up delays;
//! the bridge probes the port until it accepts a connection or the
//! overall deadline passes. Individual probe failures are expected and
//! never surfaced, only the deadline is.

use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

/// Per-probe connect cap; each probe is also capped by the remaining
/// overall budget.
const PROBE_TIMEOUT: Duration = Duration::from_millis(750);

#[derive(Debug)]
pub enum ReadinessError {
    /// The port never accepted a connection within the deadline
    Timeout {
        host: String,
        port: u16,
        waited: Duration,
    },
}

impl fmt::Display for ReadinessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessError::Timeout { host, port, waited } => write!(
                f,
                "{}:{} did not accept connections within {:?}",
                host, port, waited
            ),
        }
    }
}

impl std::error::Error for ReadinessError {}

/// Wait until `host:port` accepts a TCP connection.
///
/// Probes with a sub-second connect timeout, sleeping `interval`
/// between probes, until one succeeds or `overall` elapses. The probe
/// socket is dropped immediately either way. Returns no later than
/// `overall + interval` after the call started.
pub async fn wait_for_port(
    host: &str,
    port: u16,
    overall: Duration,
    interval: Duration,
) -> Result<(), ReadinessError> {
    let started = Instant::now();
    let deadline = started + overall;
    let mut attempts = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!(host, port, attempts, "port never became ready");
            return Err(ReadinessError::Timeout {
                host: host.to_string(),
                port,
                waited: started.elapsed(),
            });
        }

        attempts += 1;
        let probe_budget = remaining.min(PROBE_TIMEOUT);
        match timeout(probe_budget, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                // Probe socket closed immediately; the session opens its own.
                drop(stream);
                debug!(host, port, attempts, elapsed = ?started.elapsed(), "port is accepting connections");
                return Ok(());
            }
            Ok(Err(e)) => trace!(host, port, attempt = attempts, error = %e, "probe refused"),
            Err(_) => trace!(host, port, attempt = attempts, "probe timed out"),
        }

        sleep(interval.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}
