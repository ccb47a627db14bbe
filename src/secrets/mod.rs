//! Credential resolution
//!
//! Credentials are referenced by name in configuration and fetched
//! from a pluggable backing store at invocation time; the driver never
//! reads raw secret material from configuration. Stored values follow
//! a structured convention: a JSON object with a `value` field unwraps
//! to that field, anything else is returned verbatim. Known
//! placeholder sentinels mark a credential that was provisioned but
//! never configured; they resolve successfully with a warning so the
//! failure surfaces later as an auth rejection, not a config error.

mod store;


pub use store::{DirStore, EnvStore, SecretStore, StaticStore};

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

/// What a credential reference is for. Each kind has its own
/// placeholder sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    BrokerUsername,
    BrokerPassword,
    OverlayAuthKey,
}

impl SecretKind {
    /// The non-secret sentinel that marks this credential as not yet
    /// configured for production.
    pub fn placeholder(&self) -> &'static str {
        match self {
            SecretKind::BrokerUsername => "REPLACE_WITH_MQTT_USERNAME",
            SecretKind::BrokerPassword => "REPLACE_WITH_MQTT_PASSWORD",
            SecretKind::OverlayAuthKey => "REPLACE_WITH_OVERLAY_AUTH_KEY",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SecretKind::BrokerUsername => "broker-username",
            SecretKind::BrokerPassword => "broker-password",
            SecretKind::OverlayAuthKey => "overlay-auth-key",
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors from the backing store
#[derive(Debug)]
pub enum SecretError {
    /// The reference does not exist in the store
    NotFound(String),
    /// The backing store could not be reached or read
    Backend(String),
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretError::NotFound(reference) => write!(f, "secret '{}' not found", reference),
            SecretError::Backend(msg) => write!(f, "secret store error: {}", msg),
        }
    }
}

impl std::error::Error for SecretError {}

/// A resolved credential
#[derive(Debug, Clone)]
pub struct Secret {
    /// The reference it was resolved from
    pub reference: String,
    /// The unwrapped value
    pub value: String,
    /// True when the value equals the kind's placeholder sentinel
    pub placeholder: bool,
}

/// Resolves credential references against a backing store.
///
/// Holds no mutable state, so independent references may be resolved
/// concurrently.
#[derive(Clone)]
pub struct SecretResolver {
    store: Arc<dyn SecretStore>,
}

impl SecretResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Resolve a credential reference.
    ///
    /// An absent or empty reference is `Ok(None)` — the credential is
    /// simply not configured. A reference the store cannot serve is an
    /// error. A placeholder value resolves successfully but is flagged
    /// and logged.
    pub async fn resolve(
        &self,
        kind: SecretKind,
        reference: &str,
    ) -> Result<Option<Secret>, SecretError> {
        if reference.is_empty() {
            return Ok(None);
        }

        let stored = self.store.fetch(reference).await?;
        let value = unwrap_stored(&stored);

        let placeholder = value == kind.placeholder();
        if placeholder {
            warn!(
                kind = %kind,
                reference,
                "credential still holds its placeholder value; not ready for production"
            );
        }

        Ok(Some(Secret {
            reference: reference.to_string(),
            value,
            placeholder,
        }))
    }
}

/// Unwrap the `{"value": ...}` stored convention. Non-JSON or JSON
/// without a `value` field is returned verbatim; a non-string `value`
/// is carried as its serialization.
fn unwrap_stored(stored: &str) -> String {
    match serde_json::from_str::<Value>(stored) {
        Ok(Value::Object(map)) => match map.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => stored.to_string(),
        },
        _ => stored.to_string(),
    }
}
