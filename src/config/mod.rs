//! Configuration Module
//!
//! Provides TOML-based configuration for Statecast with support for:
//! - Broker target (host, port, topic) and per-stage deadlines
//! - Overlay tunnel bring-up settings
//! - Relay selection (direct or SOCKS5)
//! - Credential references and the secret store backend
//! - Retry policy
//! - Environment variable overrides (STATECAST__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use ipnet::Ipv4Net;
use regex::Regex;
use serde::Deserialize;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure, immutable once loaded
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker target and session deadlines
    pub broker: BrokerConfig,
    /// Broker authentication (credential references)
    pub auth: AuthConfig,
    /// Overlay tunnel configuration
    pub overlay: OverlayConfig,
    /// Relay selection
    pub relay: RelayConfig,
    /// Secret store backend
    pub secrets: SecretsConfig,
    /// Retry policy for the publish attempt
    pub retry: RetryConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Broker target and per-stage deadlines
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name or address (required, non-empty)
    pub host: String,
    /// Broker transport port
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Topic to publish on (required, non-empty)
    pub topic: String,
    /// MQTT client identifier (default: statecast-<hostname>-<pid>)
    pub client_id: Option<String>,
    /// DNS server to write into the resolver file once the tunnel is up
    pub dns_override: Option<String>,
    /// Keep alive announced in CONNECT, in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    /// Overall budget for the broker port to accept connections
    #[serde(with = "humantime_serde", default = "default_port_wait_timeout")]
    pub port_wait_timeout: Duration,
    /// Pause between port probes
    #[serde(with = "humantime_serde", default = "default_port_wait_interval")]
    pub port_wait_interval: Duration,
    /// CONNECT + CONNACK deadline, independent of the retry budget
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    /// PUBACK deadline
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,
}

fn default_broker_port() -> u16 {
    1883
}
fn default_keep_alive() -> u16 {
    60
}
fn default_port_wait_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_port_wait_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_ack_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_broker_port(),
            topic: String::new(),
            client_id: None,
            dns_override: None,
            keep_alive: default_keep_alive(),
            port_wait_timeout: default_port_wait_timeout(),
            port_wait_interval: default_port_wait_interval(),
            handshake_timeout: default_handshake_timeout(),
            ack_timeout: default_ack_timeout(),
        }
    }
}

/// Broker authentication configuration.
///
/// Holds credential references only; the material itself is resolved
/// through the secret store at invocation time.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether the CONNECT carries credentials
    pub enabled: bool,
    /// Reference for the broker username
    pub username_ref: String,
    /// Reference for the broker password
    pub password_ref: String,
}

/// Overlay tunnel configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Whether the broker is reached through the overlay network
    pub enabled: bool,
    /// Reference for the tunnel auth key (required when enabled)
    pub auth_key_ref: String,
    /// Overlay daemon binary
    #[serde(default = "default_daemon_bin")]
    pub daemon_bin: String,
    /// Companion control binary
    #[serde(default = "default_control_bin")]
    pub control_bin: String,
    /// Daemon state file
    #[serde(default = "default_state_path")]
    pub state_path: String,
    /// Daemon control socket
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Local SOCKS5 listener the daemon exposes
    #[serde(default = "default_socks5_listen")]
    pub socks5_listen: String,
    /// Address range overlay peers are assigned from
    #[serde(default = "default_overlay_cidr")]
    pub cidr: String,
    /// Deadline for the control socket to appear
    #[serde(with = "humantime_serde", default = "default_socket_timeout")]
    pub socket_timeout: Duration,
    /// Pause between control socket checks
    #[serde(with = "humantime_serde", default = "default_socket_interval")]
    pub socket_interval: Duration,
    /// Deadline for the daemon's "up" operation
    #[serde(with = "humantime_serde", default = "default_up_timeout")]
    pub up_timeout: Duration,
    /// Deadline for a usable peer route to appear
    #[serde(with = "humantime_serde", default = "default_route_timeout")]
    pub route_timeout: Duration,
    /// Pause between peer status polls
    #[serde(with = "humantime_serde", default = "default_route_interval")]
    pub route_interval: Duration,
    /// Bring-up attempts for the whole tunnel (1 = no retry)
    #[serde(default = "default_bringup_attempts")]
    pub bringup_attempts: u32,
    /// Leave the daemon running for warm reuse
    #[serde(default = "default_true")]
    pub leave_running: bool,
    /// Resolver file rewritten by the DNS override
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: String,
}

fn default_daemon_bin() -> String {
    "tailscaled".to_string()
}
fn default_control_bin() -> String {
    "tailscale".to_string()
}
fn default_state_path() -> String {
    "/tmp/statecast/tailscaled.state".to_string()
}
fn default_socket_path() -> String {
    "/tmp/statecast/tailscaled.sock".to_string()
}
fn default_socks5_listen() -> String {
    "localhost:1055".to_string()
}
fn default_overlay_cidr() -> String {
    "100.64.0.0/10".to_string()
}
fn default_socket_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_socket_interval() -> Duration {
    Duration::from_millis(250)
}
fn default_up_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_route_timeout() -> Duration {
    Duration::from_secs(20)
}
fn default_route_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_bringup_attempts() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_resolv_conf() -> String {
    "/etc/resolv.conf".to_string()
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auth_key_ref: String::new(),
            daemon_bin: default_daemon_bin(),
            control_bin: default_control_bin(),
            state_path: default_state_path(),
            socket_path: default_socket_path(),
            socks5_listen: default_socks5_listen(),
            cidr: default_overlay_cidr(),
            socket_timeout: default_socket_timeout(),
            socket_interval: default_socket_interval(),
            up_timeout: default_up_timeout(),
            route_timeout: default_route_timeout(),
            route_interval: default_route_interval(),
            bringup_attempts: default_bringup_attempts(),
            leave_running: true,
            resolv_conf: default_resolv_conf(),
        }
    }
}

impl OverlayConfig {
    /// The overlay address range, validated at load time
    pub fn overlay_cidr(&self) -> Result<Ipv4Net, ConfigError> {
        self.cidr.parse().map_err(|e| {
            ConfigError::Validation(format!("overlay.cidr '{}' is not a CIDR: {}", self.cidr, e))
        })
    }
}

/// How the broker connection is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Plain TCP connect to the broker
    #[default]
    Direct,
    /// SOCKS5 CONNECT through the local relay port
    Socks5,
}

/// Relay configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Connection mode
    pub mode: RelayMode,
    /// Local relay address (SOCKS5 mode)
    #[serde(default = "default_relay_address")]
    pub address: String,
    /// Budget for the relay port to accept connections
    #[serde(with = "humantime_serde", default = "default_relay_ready_timeout")]
    pub ready_timeout: Duration,
    /// Pause between relay port probes
    #[serde(with = "humantime_serde", default = "default_relay_ready_interval")]
    pub ready_interval: Duration,
    /// Per-attempt connect deadline (both modes)
    #[serde(with = "humantime_serde", default = "default_relay_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_relay_address() -> String {
    "127.0.0.1:1055".to_string()
}
fn default_relay_ready_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_relay_ready_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_relay_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Direct,
            address: default_relay_address(),
            ready_timeout: default_relay_ready_timeout(),
            ready_interval: default_relay_ready_interval(),
            connect_timeout: default_relay_connect_timeout(),
        }
    }
}

impl RelayConfig {
    /// The relay socket address, validated at load time
    pub fn relay_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address.parse().map_err(|e| {
            ConfigError::Validation(format!(
                "relay.address '{}' is not a socket address: {}",
                self.address, e
            ))
        })
    }
}

/// Secret store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackend {
    /// Environment variables
    #[default]
    Env,
    /// One file per reference in a secrets directory
    File,
}

/// Secret store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Which backend serves credential references
    pub backend: SecretBackend,
    /// Secrets directory (file backend)
    #[serde(default = "default_secrets_dir")]
    pub dir: String,
}

fn default_secrets_dir() -> String {
    "/run/secrets".to_string()
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: SecretBackend::Env,
            dir: default_secrets_dir(),
        }
    }
}

/// Retry policy for the publish attempt
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum publish attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff; attempt k waits base * k before the next
    #[serde(with = "humantime_serde", default = "default_backoff_base")]
    pub backoff_base: Duration,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base() -> Duration {
    Duration::from_secs(2)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Loading does not validate: required fields like the broker host
    /// may still arrive through CLI flags, so validation runs in the
    /// driver once every override is applied.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `STATECAST__` prefix with double underscores for nesting:
    ///    - `STATECAST__BROKER__HOST=100.74.60.20` overrides `broker.host`
    ///    - `STATECAST__OVERLAY__ENABLED=true` overrides `overlay.enabled`
    ///    - `STATECAST__RETRY__MAX_ATTEMPTS=5` overrides `retry.max_attempts`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("broker.host", "")?
            .set_default("broker.port", 1883)?
            .set_default("broker.topic", "")?
            .set_default("broker.keep_alive", 60)?
            .set_default("auth.enabled", false)?
            .set_default("overlay.enabled", false)?
            .set_default("overlay.bringup_attempts", 1)?
            .set_default("overlay.leave_running", true)?
            .set_default("relay.mode", "direct")?
            .set_default("relay.address", "127.0.0.1:1055")?
            .set_default("secrets.backend", "env")?
            .set_default("secrets.dir", "/run/secrets")?
            .set_default("retry.max_attempts", 3)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (STATECAST__BROKER__HOST, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("STATECAST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Runs once at load time, before any network action; a bridge
    /// with a bad config must fail before it touches the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Validation(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.topic.is_empty() {
            return Err(ConfigError::Validation(
                "broker.topic must not be empty".to_string(),
            ));
        }

        if self.overlay.enabled {
            if self.overlay.auth_key_ref.is_empty() {
                return Err(ConfigError::Validation(
                    "overlay.auth_key_ref is required when overlay is enabled".to_string(),
                ));
            }
            self.overlay.overlay_cidr()?;
            if self.overlay.bringup_attempts == 0 {
                return Err(ConfigError::Validation(
                    "overlay.bringup_attempts must be at least 1".to_string(),
                ));
            }
        }

        // Auth with no references would silently connect anonymously
        if self.auth.enabled
            && self.auth.username_ref.is_empty()
            && self.auth.password_ref.is_empty()
        {
            return Err(ConfigError::Validation(
                "auth is enabled but neither username_ref nor password_ref is set".to_string(),
            ));
        }

        if self.relay.mode == RelayMode::Socks5 {
            self.relay.relay_addr()?;
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
