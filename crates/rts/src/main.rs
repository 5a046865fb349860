//! Real-time service
//!
//! Resolves metric requests from the cache or through the protocol
//! translators, and keeps subscribed metrics warm with background polls.

use anyhow::Result;
use rts_lib::{
    backends::{MemoryCache, MemoryHistory, MemoryStore},
    broker::MemoryBroker,
    health::HealthRegistry,
    observability::{RtsMetrics, StructuredLogger},
    Collaborators, RtsService,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const RTS_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = config::RtsConfig::load()?;
    info!(service_id = %config.service_id, api_port = config.api_port, "Real-time service configured");

    let health_registry = HealthRegistry::new();
    let metrics = RtsMetrics::new();
    let logger = StructuredLogger::new(config.service_id.clone());

    // Single-node deployment: every collaborator lives in this process
    let collaborators = Collaborators {
        broker: Arc::new(MemoryBroker::new()),
        cache: Arc::new(MemoryCache::new()),
        store: Arc::new(MemoryStore::new()),
        history: Some(Arc::new(MemoryHistory::new())),
    };

    let service = RtsService::start(config.settings(), collaborators, health_registry.clone()).await;
    logger.log_startup(RTS_VERSION);

    let app_state = Arc::new(
        api::AppState::new(health_registry, metrics).with_pulling(service.registry().clone()),
    );
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            logger.log_shutdown("SIGINT received");
        }
        served = &mut api_handle => {
            match served {
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => {}
            }
            logger.log_shutdown("API server exited");
        }
    }

    service.shutdown().await;
    api_handle.abort();

    Ok(())
}
