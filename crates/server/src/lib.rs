// Docdispatch server
// Hosts the dispatch engine in-process next to the submission, ops and
// metrics HTTP surface.

pub mod activity;
pub mod api;
pub mod openapi;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use docdispatch_engine::{
    DispatchEngine, DispatchMetrics, InMemoryJobStore, JobStore, PostgresJobStore,
};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::activity::OpsActivityLog;
use crate::openapi::ApiDoc;

/// Process-level settings outside the engine's own configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: String,
    /// PostgreSQL connection string; `None` selects the in-memory store
    pub database_url: Option<String>,
    /// Pool size for the PostgreSQL store
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            max_connections: 10,
        }
    }
}

impl ServerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `HTTP_ADDR`: Listen address (default: "0.0.0.0:8080")
    /// - `DATABASE_URL`: PostgreSQL URL (default: in-memory store)
    /// - `DATABASE_MAX_CONNECTIONS`: Pool size (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            http_addr: std::env::var("HTTP_ADDR").unwrap_or(defaults.http_addr),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_connections),
        }
    }
}

/// Open the configured store, applying migrations for PostgreSQL
pub async fn open_store(config: &ServerConfig) -> Result<Arc<dyn JobStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url, config.max_connections)
                .await
                .context("Failed to connect to database")?;
            store
                .migrate()
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Connected to database");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!(
                "DATABASE_URL not set, using in-memory store; jobs are not shared across processes and are lost on exit"
            );
            Ok(Arc::new(InMemoryJobStore::new()))
        }
    }
}

/// Build the HTTP application
///
/// Swagger UI is served at `/swagger-ui` with the document at
/// `/api-doc/openapi.json`.
pub fn build_app(
    store: Arc<dyn JobStore>,
    metrics: DispatchMetrics,
    engine: Arc<DispatchEngine>,
) -> Router {
    let activity = Arc::new(OpsActivityLog::new());

    Router::new()
        .merge(api::system::routes(api::system::AppState::new(metrics, engine)))
        .merge(api::dispatches::routes(api::dispatches::AppState::new(
            Arc::clone(&store),
        )))
        .merge(api::ops::routes(api::ops::AppState::new(store, activity)))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}
