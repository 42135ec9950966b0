// Ops routes
// Manual remediation, a status overview and the activity feed. These mutate
// the same rows as the engine but never take part in the lease protocol.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use docdispatch_engine::{DispatchJob, JobStore, StatusSnapshot, StoreError};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use super::common::{internal_error, not_found, ApiError, ErrorResponse};
use crate::activity::{ActivityEvent, OpsActivityLog};

/// Processing rows untouched for this long count as stale in the snapshot
const STALE_AFTER_MINUTES: i64 = 5;

const DEFAULT_RECENT: u32 = 15;
const MAX_RECENT: u32 = 100;

const DEFAULT_ACTIVITY: usize = 20;
const MAX_ACTIVITY: usize = 100;

/// Activity feed source for operator actions
const OPS_SOURCE: &str = "OPS";

/// App state for ops routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub activity: Arc<OpsActivityLog>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, activity: Arc<OpsActivityLog>) -> Self {
        Self { store, activity }
    }
}

/// Query parameters for the recent dispatch requests view
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
#[serde(rename_all = "camelCase")]
pub struct RecentQuery {
    /// Rows to return; defaults to 15, capped at 100
    #[serde(default)]
    pub take: Option<i64>,
    /// Include Completed rows
    #[serde(default)]
    pub show_completed: bool,
}

impl RecentQuery {
    fn effective_take(&self) -> u32 {
        match self.take {
            Some(take) if take >= 1 => take.min(MAX_RECENT as i64) as u32,
            _ => DEFAULT_RECENT,
        }
    }
}

/// Query parameters for the activity feed
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ActivityQuery {
    /// Newest events to return; defaults to 20, capped at 100
    #[serde(default)]
    pub take: Option<i64>,
}

impl ActivityQuery {
    fn effective_take(&self) -> usize {
        match self.take {
            Some(take) if take >= 1 => (take as u64).min(MAX_ACTIVITY as u64) as usize,
            _ => DEFAULT_ACTIVITY,
        }
    }
}

/// Create ops routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/ops/snapshot", get(snapshot))
        .route("/ops/recent", get(recent))
        .route("/ops/activity", get(activity))
        .route("/ops/dispatch/:id/requeue", post(requeue))
        .route("/ops/dispatch/:id/release-lock", post(release_lock))
        .route("/ops/dispatch/:id/clear-error", post(clear_error))
        .route("/ops/dispatch/:id/reset-retries", post(reset_retries))
        .with_state(state)
}

/// GET /ops/snapshot - Counts by status, lease and staleness
#[utoipa::path(
    get,
    path = "/ops/snapshot",
    responses(
        (status = 200, description = "Status snapshot", body = StatusSnapshot),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn snapshot(State(state): State<AppState>) -> Result<Json<StatusSnapshot>, ApiError> {
    let now = Utc::now();
    let snapshot = state
        .store
        .snapshot(now, now - Duration::minutes(STALE_AFTER_MINUTES))
        .await
        .map_err(|e| internal_error("Failed to load status snapshot", e))?;

    Ok(Json(snapshot))
}

/// GET /ops/recent - Most recently updated dispatch requests
#[utoipa::path(
    get,
    path = "/ops/recent",
    params(RecentQuery),
    responses(
        (status = 200, description = "Recently updated dispatch requests", body = Vec<DispatchJob>),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<DispatchJob>>, ApiError> {
    let jobs = state
        .store
        .recent(query.effective_take(), query.show_completed)
        .await
        .map_err(|e| internal_error("Failed to load recent dispatch requests", e))?;

    Ok(Json(jobs))
}

/// GET /ops/activity - Newest operator activity events, oldest first
#[utoipa::path(
    get,
    path = "/ops/activity",
    params(ActivityQuery),
    responses(
        (status = 200, description = "Activity feed", body = Vec<ActivityEvent>)
    ),
    tag = "ops"
)]
pub async fn activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Json<Vec<ActivityEvent>> {
    Json(state.activity.latest(query.effective_take()))
}

/// POST /ops/dispatch/:id/requeue - Force back to Pending
#[utoipa::path(
    post,
    path = "/ops/dispatch/{id}/requeue",
    params(("id" = Uuid, Path, description = "Dispatch request ID")),
    responses(
        (status = 200, description = "Requeued", body = DispatchJob),
        (status = 404, description = "Dispatch request not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn requeue(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchJob>, ApiError> {
    let result = state.store.force_requeue(id, Utc::now()).await;
    remediated(&state, "Requeued", id, result)
}

/// POST /ops/dispatch/:id/release-lock - Clear lease fields
#[utoipa::path(
    post,
    path = "/ops/dispatch/{id}/release-lock",
    params(("id" = Uuid, Path, description = "Dispatch request ID")),
    responses(
        (status = 200, description = "Lease released", body = DispatchJob),
        (status = 404, description = "Dispatch request not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn release_lock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchJob>, ApiError> {
    let result = state.store.release_lock(id, Utc::now()).await;
    remediated(&state, "Released lock on", id, result)
}

/// POST /ops/dispatch/:id/clear-error - Clear last error
#[utoipa::path(
    post,
    path = "/ops/dispatch/{id}/clear-error",
    params(("id" = Uuid, Path, description = "Dispatch request ID")),
    responses(
        (status = 200, description = "Error cleared", body = DispatchJob),
        (status = 404, description = "Dispatch request not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn clear_error(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchJob>, ApiError> {
    let result = state.store.clear_error(id, Utc::now()).await;
    remediated(&state, "Cleared error on", id, result)
}

/// POST /ops/dispatch/:id/reset-retries - Reset retry count
#[utoipa::path(
    post,
    path = "/ops/dispatch/{id}/reset-retries",
    params(("id" = Uuid, Path, description = "Dispatch request ID")),
    responses(
        (status = 200, description = "Retries reset", body = DispatchJob),
        (status = 404, description = "Dispatch request not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "ops"
)]
pub async fn reset_retries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchJob>, ApiError> {
    let result = state.store.reset_retries(id, Utc::now()).await;
    remediated(&state, "Reset retries on", id, result)
}

fn remediated(
    state: &AppState,
    action: &str,
    id: Uuid,
    result: Result<Option<DispatchJob>, StoreError>,
) -> Result<Json<DispatchJob>, ApiError> {
    match result {
        Ok(Some(job)) => {
            tracing::info!(job_id = %id, action, status = %job.status, "Ops action applied");
            state
                .activity
                .add(OPS_SOURCE, format!("{} {} (now {}).", action, id, job.status));
            Ok(Json(job))
        }
        Ok(None) => Err(not_found("dispatch request")),
        Err(e) => Err(internal_error("Ops action failed", e)),
    }
}
