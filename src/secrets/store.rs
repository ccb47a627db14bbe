//! Backing stores for credential references

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::SecretError;

/// A backing store that serves stored representations by reference.
///
/// Implementations must not cache mutable state; the resolver may
/// fetch independent references concurrently.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<String, SecretError>;
}

/// Serves references from process environment variables.
pub struct EnvStore;

#[async_trait]
impl SecretStore for EnvStore {
    async fn fetch(&self, reference: &str) -> Result<String, SecretError> {
        match std::env::var(reference) {
            Ok(value) => Ok(value),
            Err(std::env::VarError::NotPresent) => {
                Err(SecretError::NotFound(reference.to_string()))
            }
            Err(e) => Err(SecretError::Backend(e.to_string())),
        }
    }
}

/// Serves references from a directory of one file per reference,
/// the layout used by mounted secret volumes.
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// References are file names, never paths; anything that would
    /// escape the secrets directory is rejected.
    fn entry_path(&self, reference: &str) -> Result<PathBuf, SecretError> {
        let candidate = Path::new(reference);
        let plain_name = candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
            && candidate.components().count() == 1;
        if !plain_name {
            return Err(SecretError::Backend(format!(
                "secret reference '{}' is not a plain file name",
                reference
            )));
        }
        Ok(self.dir.join(candidate))
    }
}

#[async_trait]
impl SecretStore for DirStore {
    async fn fetch(&self, reference: &str) -> Result<String, SecretError> {
        let path = self.entry_path(reference)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content.trim_end_matches('\n').to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound(reference.to_string()))
            }
            Err(e) => Err(SecretError::Backend(format!(
                "reading {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Fixed in-memory store for tests.
#[derive(Default)]
pub struct StaticStore {
    entries: HashMap<String, String>,
}

impl StaticStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: &str, stored: &str) -> Self {
        self.entries.insert(reference.to_string(), stored.to_string());
        self
    }
}

#[async_trait]
impl SecretStore for StaticStore {
    async fn fetch(&self, reference: &str) -> Result<String, SecretError> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(reference.to_string()))
    }
}
