//! Daemon status view
//!
//! Parsed from the control binary's `status --json` output. Only the
//! fields the route check needs are modeled; the rest of the document
//! is ignored.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;
use serde::Deserialize;

/// Top-level status document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelStatus {
    /// Daemon backend state ("Running", "NeedsLogin", ...)
    #[serde(rename = "BackendState", default)]
    pub backend_state: String,
    /// Known peers keyed by node key
    #[serde(rename = "Peer", default)]
    pub peers: HashMap<String, PeerStatus>,
}

impl TunnelStatus {
    /// Parse the control binary's JSON output
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// One peer in the status view
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerStatus {
    #[serde(rename = "HostName", default)]
    pub host_name: String,
    /// Addresses assigned to the peer; overlay and non-overlay mixed
    #[serde(rename = "TailscaleIPs", default)]
    pub addrs: Vec<IpAddr>,
    #[serde(rename = "Online", default)]
    pub online: bool,
}

impl PeerStatus {
    /// The peer's address inside the overlay range, if it has one
    pub fn overlay_addr(&self, cidr: &Ipv4Net) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|addr| match addr {
            IpAddr::V4(v4) if cidr.contains(v4) => Some(*v4),
            _ => None,
        })
    }
}
