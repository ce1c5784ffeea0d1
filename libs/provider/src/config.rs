//! Provider configuration records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of language-model backend a provider talks to.
///
/// A closed set: the type selects defaults and lets operators reason about a
/// config at a glance, but all variants are invoked through the same
/// capability surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    OpenAi,
    Anthropic,
    /// Any backend speaking the generic completion shape; requires an
    /// explicit endpoint.
    Custom,
}

/// An opaque credential handle.
///
/// The value is carried through to the transport and nowhere else: `Debug`
/// and `Serialize` both redact it, so configs can be logged and listed
/// without leaking secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("***")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(String::deserialize(deserializer)?))
    }
}

/// Immutable configuration for one named provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry name; unique among registered providers.
    pub name: String,

    /// Backend kind.
    pub provider_type: ProviderType,

    /// Opaque credential handle passed through to the transport.
    pub credentials: Secret,

    /// Model identifier sent with every invocation.
    pub model: String,

    /// Explicit endpoint override. Required for `Custom` providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Free-form provider options forwarded verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ProviderConfig {
    /// Cheap structural validation; no network calls.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("provider name cannot be empty".to_string());
        }
        if self.model.is_empty() {
            return Err("model cannot be empty".to_string());
        }
        if self.credentials.is_empty() {
            return Err("credentials cannot be empty".to_string());
        }
        if self.provider_type == ProviderType::Custom && self.endpoint.is_none() {
            return Err("custom providers require an endpoint".to_string());
        }
        Ok(())
    }
}
