//! The provider registry.
//!
//! An explicitly constructed, passed-by-reference object: created once at
//! orchestrator startup, shared via `Arc`, torn down with the process. No
//! module-level globals.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

use crate::config::ProviderConfig;
use crate::transport::{ProviderTransport, TransportError};

/// Errors from registry operations and invocation.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider already registered: {0}")]
    DuplicateName(String),

    #[error("provider not found: {0}")]
    NotFound(String),

    #[error("invalid provider config: {0}")]
    InvalidConfig(String),

    #[error("provider invocation failed: {0}")]
    Invoke(#[from] TransportError),
}

/// One registered provider: the config plus its cached validation outcome.
///
/// Validation runs lazily on first resolve and is cached per config identity;
/// replacing a provider installs a fresh entry with an empty cache.
struct ProviderEntry {
    config: ProviderConfig,
    validated: OnceCell<Result<(), String>>,
}

/// Maps provider names to configuration and produces bound invocation
/// capabilities.
pub struct ProviderRegistry {
    entries: RwLock<BTreeMap<String, Arc<ProviderEntry>>>,
    transport: Arc<dyn ProviderTransport>,
}

impl ProviderRegistry {
    /// Create a registry backed by the given transport.
    pub fn new(transport: Arc<dyn ProviderTransport>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            transport,
        }
    }

    /// Register a provider under its configured name.
    ///
    /// Fails with [`ProviderError::DuplicateName`] if the name is taken and
    /// `replace` is false. Replacement swaps the whole entry: a resolve in
    /// progress keeps the old config, a later resolve sees only the new one.
    pub async fn register(&self, config: ProviderConfig, replace: bool) -> Result<(), ProviderError> {
        if config.name.is_empty() {
            return Err(ProviderError::InvalidConfig(
                "provider name cannot be empty".to_string(),
            ));
        }

        let entry = Arc::new(ProviderEntry {
            config,
            validated: OnceCell::new(),
        });

        let mut entries = self.entries.write().await;
        let name = entry.config.name.clone();

        if entries.contains_key(&name) && !replace {
            return Err(ProviderError::DuplicateName(name));
        }

        let replaced = entries.insert(name.clone(), entry).is_some();
        info!(provider = %name, replaced, "Provider registered");

        Ok(())
    }

    /// Resolve a name to a bound invocation capability.
    ///
    /// Validates the config once per registration and caches the outcome; no
    /// network calls happen here.
    pub async fn resolve(&self, name: &str) -> Result<ProviderHandle, ProviderError> {
        let entry = {
            let entries = self.entries.read().await;
            entries
                .get(name)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(name.to_string()))?
        };

        let validation = entry
            .validated
            .get_or_init(|| {
                let outcome = entry.config.validate();
                async move { outcome }
            })
            .await;

        if let Err(reason) = validation {
            return Err(ProviderError::InvalidConfig(reason.clone()));
        }

        Ok(ProviderHandle {
            entry,
            transport: Arc::clone(&self.transport),
        })
    }

    /// Registered provider names, lexicographically sorted.
    pub async fn list(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Remove a provider. Handles already resolved keep their config.
    pub async fn remove(&self, name: &str) -> Result<(), ProviderError> {
        let mut entries = self.entries.write().await;
        entries
            .remove(name)
            .map(|_| info!(provider = %name, "Provider removed"))
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }

    /// Whether a provider name is currently registered.
    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }
}

/// A bound invocation capability.
///
/// The only operation the rest of the system may call; the stored credentials
/// and model never leave the handle.
#[derive(Clone)]
pub struct ProviderHandle {
    entry: Arc<ProviderEntry>,
    transport: Arc<dyn ProviderTransport>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("model", &self.model())
            .finish_non_exhaustive()
    }
}

impl ProviderHandle {
    /// Invoke the provider with the given input.
    pub async fn invoke(&self, input: &str) -> Result<String, ProviderError> {
        let output = self.transport.complete(&self.entry.config, input).await?;
        Ok(output)
    }

    /// The model this handle is bound to.
    pub fn model(&self) -> &str {
        &self.entry.config.model
    }
}
