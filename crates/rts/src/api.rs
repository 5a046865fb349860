//! HTTP API for health checks and Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use rts_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::RtsMetrics,
    pulling::PullingRegistry,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: RtsMetrics,
    pub pulling: Option<PullingRegistry>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: RtsMetrics) -> Self {
        Self {
            health_registry,
            metrics,
            pulling: None,
        }
    }

    pub fn with_pulling(mut self, registry: PullingRegistry) -> Self {
        self.pulling = Some(registry);
        self
    }
}

/// One pulling group as reported by `/pulling`
#[derive(Debug, Serialize)]
struct GroupView {
    key: String,
    interval_ms: u64,
    metrics: Vec<EntryView>,
}

#[derive(Debug, Serialize)]
struct EntryView {
    metric_id: i32,
    pulling_remaining: u16,
    pulling_times: u16,
}

/// Returns 200 while operational, 503 once a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = if health.status == ComponentStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Live pulling groups and their remaining budgets
async fn pulling(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(registry) = &state.pulling else {
        return Json(Vec::<GroupView>::new());
    };

    let groups = registry
        .keys()
        .iter()
        .filter_map(|key| registry.snapshot(key))
        .map(|snapshot| GroupView {
            key: snapshot.key.to_string(),
            interval_ms: snapshot.interval.as_millis() as u64,
            metrics: snapshot
                .entries
                .iter()
                .map(|entry| EntryView {
                    metric_id: entry.metric_id(),
                    pulling_remaining: entry.pulling_remaining(),
                    pulling_times: entry.pulling_times(),
                })
                .collect(),
        })
        .collect();

    Json(groups)
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/pulling", get(pulling))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
