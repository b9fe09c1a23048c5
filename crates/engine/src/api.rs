//! HTTP API for health checks, engine status and Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use engine_lib::{
    health::HealthStatus,
    models::{PerformanceMode, PerformanceProfile, SystemMetrics},
    pool::{ConnectionPool, PoolStats},
    schedule::{Scheduler, ThrottleLevel},
    worker::{WorkerPool, WorkerPoolStats},
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub pool: Arc<ConnectionPool>,
    pub workers: Option<Arc<WorkerPool>>,
}

impl AppState {
    pub fn new(
        scheduler: Arc<Scheduler>,
        pool: Arc<ConnectionPool>,
        workers: Option<Arc<WorkerPool>>,
    ) -> Self {
        Self {
            scheduler,
            pool,
            workers,
        }
    }
}

/// Full control-plane readout
#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub mode: PerformanceMode,
    pub high_performance_enabled: bool,
    pub throttle_level: ThrottleLevel,
    pub throttle_percent: u8,
    pub should_throttle: bool,
    pub health: HealthStatus,
    pub profile: PerformanceProfile,
    pub metrics: SystemMetrics,
    pub error_rate: f64,
    pub pool: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerPoolStats>,
}

/// Health check response - returns 200 unless the engine is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.scheduler.monitor().health();

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK, // Still operational
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<EngineStatus> {
    let scheduler = &state.scheduler;
    let monitor = scheduler.monitor();
    let mode = scheduler.current_mode();
    let throttle_level = scheduler.throttle_level();

    Json(EngineStatus {
        mode,
        high_performance_enabled: scheduler.high_performance_enabled(),
        throttle_level,
        throttle_percent: throttle_level.percent(),
        should_throttle: scheduler.should_throttle(),
        health: monitor.status(),
        profile: scheduler.profile_for(mode).clone(),
        metrics: monitor.metrics(),
        error_rate: monitor.error_rate(),
        pool: state.pool.stats(),
        workers: state.workers.as_ref().map(|w| w.stats()),
    })
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
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

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
