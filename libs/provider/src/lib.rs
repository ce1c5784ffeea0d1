//! # aviary-provider
//!
//! Named registry of language-model providers and the uniform invocation
//! capability the rest of the fleet consumes.
//!
//! A provider is configuration data, not code: `{name, type, credentials,
//! model, extra options}`. Resolving a name yields a [`ProviderHandle`] whose
//! single operation `invoke(input) -> output` is bound to the stored model and
//! credentials. Everything provider-specific lives behind the
//! [`ProviderTransport`] seam; this crate ships only a generic JSON-over-HTTP
//! transport, and per-provider adapters plug in from outside.

mod config;
mod registry;
mod transport;

pub use config::{ProviderConfig, ProviderType, Secret};
pub use registry::{ProviderError, ProviderHandle, ProviderRegistry};
pub use transport::{HttpCompletionTransport, ProviderTransport, TransportError};
