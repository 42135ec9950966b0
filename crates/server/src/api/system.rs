// Health and Prometheus exposition routes

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use docdispatch_engine::{DispatchEngine, DispatchMetrics, EngineStatus};
use serde::Serialize;

/// State for health and metrics endpoints
#[derive(Clone)]
pub struct AppState {
    pub metrics: DispatchMetrics,
    pub engine: Arc<DispatchEngine>,
}

impl AppState {
    pub fn new(metrics: DispatchMetrics, engine: Arc<DispatchEngine>) -> Self {
        Self { metrics, engine }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub worker_id: String,
    pub engine: &'static str,
}

/// Create system routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// GET /health - Liveness plus engine state
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = match state.engine.status() {
        EngineStatus::Running => "running",
        EngineStatus::Draining => "draining",
        EngineStatus::Stopped => "stopped",
    };

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        worker_id: state.engine.worker_id().to_string(),
        engine,
    })
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
