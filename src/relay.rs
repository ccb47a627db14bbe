//! Relay connector
//!
//! One connector, two modes: a plain TCP connect to the broker, or a
//! SOCKS5 CONNECT through the local relay port the overlay daemon
//! exposes. Every call is a single attempt with one overall deadline;
//! the retry policy lives one layer up.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::RelayMode;

/// Errors from a single connect attempt. All of them are retryable.
#[derive(Debug)]
pub enum RelayError {
    /// The connect or handshake did not finish within the deadline
    Timeout,
    /// Transport error talking to the relay or the target
    Io(String),
    /// The relay spoke something other than no-auth SOCKS5
    Handshake(String),
    /// The relay answered the CONNECT with a non-success reply code
    Refused(u8),
    /// The destination host cannot be expressed in a CONNECT request
    BadTarget(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Timeout => write!(f, "connect timed out"),
            RelayError::Io(msg) => write!(f, "transport error: {}", msg),
            RelayError::Handshake(msg) => write!(f, "SOCKS5 handshake failed: {}", msg),
            RelayError::Refused(code) => {
                write!(f, "relay refused: {} ({:#04x})", reply_code_name(*code), code)
            }
            RelayError::BadTarget(msg) => write!(f, "bad target: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

/// Human-readable SOCKS5 reply code names (RFC 1928 §6)
fn reply_code_name(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply",
    }
}

/// Opens the byte stream the broker session runs over.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    mode: RelayMode,
    relay_addr: SocketAddr,
    connect_timeout: Duration,
}

impl RelayConnector {
    pub fn direct(connect_timeout: Duration) -> Self {
        // relay_addr is unused in direct mode
        Self {
            mode: RelayMode::Direct,
            relay_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            connect_timeout,
        }
    }

    pub fn socks5(relay_addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            mode: RelayMode::Socks5,
            relay_addr,
            connect_timeout,
        }
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    /// Open a connection to `host:port`, directly or through the relay.
    /// Single attempt; the whole exchange shares one deadline.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, RelayError> {
        timeout(self.connect_timeout, self.connect_inner(host, port))
            .await
            .map_err(|_| RelayError::Timeout)?
    }

    async fn connect_inner(&self, host: &str, port: u16) -> Result<TcpStream, RelayError> {
        match self.mode {
            RelayMode::Direct => {
                let stream = TcpStream::connect((host, port))
                    .await
                    .map_err(|e| RelayError::Io(e.to_string()))?;
                debug!(host, port, "connected directly");
                Ok(stream)
            }
            RelayMode::Socks5 => {
                let mut stream = TcpStream::connect(self.relay_addr)
                    .await
                    .map_err(|e| RelayError::Io(format!("relay {}: {}", self.relay_addr, e)))?;
                socks5_connect(&mut stream, host, port).await?;
                debug!(host, port, relay = %self.relay_addr, "connected through SOCKS5 relay");
                Ok(stream)
            }
        }
    }
}

/// Perform a no-auth SOCKS5 CONNECT on an open relay stream.
async fn socks5_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<(), RelayError> {
    let io_err = |e: std::io::Error| RelayError::Io(e.to_string());

    // Greeting: version 5, one method, no authentication
    stream.write_all(&[0x05, 0x01, 0x00]).await.map_err(io_err)?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.map_err(io_err)?;
    if method[0] != 0x05 {
        return Err(RelayError::Handshake(format!(
            "relay answered version {:#04x}, not SOCKS5",
            method[0]
        )));
    }
    if method[1] != 0x00 {
        return Err(RelayError::Handshake(format!(
            "relay requires auth method {:#04x}",
            method[1]
        )));
    }

    // CONNECT request: IPv4 / IPv6 literal, or domain name
    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.push(0x01);
            request.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.push(0x04);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(RelayError::BadTarget(format!(
                    "host name longer than 255 bytes: {}",
                    host
                )));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(io_err)?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(io_err)?;
    if reply[0] != 0x05 {
        return Err(RelayError::Handshake(format!(
            "reply version {:#04x}, not SOCKS5",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(RelayError::Refused(reply[1]));
    }

    // Drain the bound address so the stream starts at the payload
    let bound_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_err)?;
            len[0] as usize
        }
        other => {
            return Err(RelayError::Handshake(format!(
                "reply address type {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await.map_err(io_err)?;

    Ok(())
}
