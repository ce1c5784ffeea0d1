//! aviary orchestrator service.
//!
//! Wires the provider registry, collaborators, and orchestrator core
//! together and serves the HTTP control plane.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use aviary_orchestrator::{
    api,
    collaborators::{
        HttpCallDispatcher, HttpReadinessProbe, HttpRuntimeLauncher, HttpTemplateSource,
    },
    config::Config,
    core::Orchestrator,
    state::AppState,
};
use aviary_provider::{HttpCompletionTransport, ProviderRegistry};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to the configured level.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting aviary orchestrator");
    info!(
        listen_addr = %config.listen_addr,
        launcher_url = %config.launcher_url,
        "Configuration loaded"
    );

    let providers = Arc::new(ProviderRegistry::new(Arc::new(
        HttpCompletionTransport::new(),
    )));

    let templates = Arc::new(HttpTemplateSource::with_timeout(Duration::from_secs(
        config.fetch_timeout_secs,
    )));
    let launcher = Arc::new(
        HttpRuntimeLauncher::new(config.launcher_url.clone()).with_timeouts(
            Duration::from_secs(config.build_timeout_secs),
            Duration::from_secs(30),
        ),
    );
    let probe = Arc::new(HttpReadinessProbe::with_timeout(Duration::from_secs(
        config.probe_timeout_secs,
    )));
    let dispatcher = Arc::new(HttpCallDispatcher::new());

    let (orchestrator, evictions) = Orchestrator::new(
        providers,
        templates,
        launcher,
        probe,
        dispatcher,
        config.orchestrator_config(),
    );

    // Graceful shutdown channel shared by the background loops.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let eviction_handle = tokio::spawn(
        orchestrator
            .clone()
            .run_eviction_loop(evictions, shutdown_rx),
    );

    let state = AppState::new(orchestrator.clone());
    let router = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(listen_addr = %config.listen_addr, "Control plane listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    });

    if let Err(e) = server.await {
        error!(error = %e, "Server error");
    }

    // Stop background work before exiting.
    let _ = shutdown_tx.send(true);
    orchestrator.shutdown().await;
    let _ = eviction_handle.await;

    info!("Orchestrator stopped");
    Ok(())
}
