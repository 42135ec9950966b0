use std::sync::Arc;

use anyhow::{Context, Result};
use docdispatch_engine::{DispatchConfig, DispatchEngine, DispatchMetrics};
use docdispatch_server::telemetry::{init_telemetry, TelemetryConfig};
use docdispatch_server::{build_app, open_store, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info,docdispatch_engine=debug")
    // - LOG_FORMAT: "json" for JSON lines
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("info,docdispatch_engine=debug".to_string());
    }
    init_telemetry(&telemetry_config)?;

    tracing::info!("docdispatch starting...");

    let server_config = ServerConfig::from_env();
    let dispatch_config = DispatchConfig::from_env();

    let store = open_store(&server_config).await?;
    let metrics = DispatchMetrics::new();
    let engine = Arc::new(DispatchEngine::with_random_verdict(
        Arc::clone(&store),
        dispatch_config,
        metrics.clone(),
    ));

    tracing::info!(
        worker_id = %engine.worker_id(),
        max_concurrency = engine.config().max_concurrency,
        "Starting dispatch engine"
    );
    engine.spawn()?;

    let app = build_app(store, metrics, Arc::clone(&engine));

    let listener = tokio::net::TcpListener::bind(&server_config.http_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", server_config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Received shutdown signal");
        })
        .await
        .context("Server error")?;

    engine.shutdown().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
