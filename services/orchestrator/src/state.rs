//! Application state shared across request handlers.

use crate::core::Orchestrator;

/// Shared application state, passed to handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}
