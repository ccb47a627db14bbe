//! Statecast - event-to-MQTT bridge over a private overlay network
//!
//! Receives one pipeline state-change event per invocation, brings up
//! connectivity to an MQTT broker that is only reachable across an
//! overlay network, and republishes the event as a JSON message at
//! QoS 1. Designed for short-lived, externally-retried invocations:
//! every stage has its own deadline, and any failure terminates the
//! invocation loudly instead of hanging.

pub mod config;
pub mod driver;
pub mod event;
pub mod mqtt;
pub mod publisher;
pub mod readiness;
pub mod relay;
pub mod retry;
pub mod secrets;
pub mod tunnel;

pub use config::{Config, ConfigError, RelayMode, SecretBackend};
pub use driver::{run, run_bridge, BridgeError, Delivery};
pub use event::{InboundEvent, OutboundPayload};
pub use publisher::{Credentials, PublishError, Publisher};
pub use readiness::{wait_for_port, ReadinessError};
pub use relay::{RelayConnector, RelayError};
pub use retry::{run_with_retry, RetryPolicy};
pub use secrets::{Secret, SecretError, SecretKind, SecretResolver, SecretStore};
pub use tunnel::{TunnelClient, TunnelController, TunnelError, TunnelState};
