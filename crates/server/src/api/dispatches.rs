// Dispatch submission and query routes
// Creates Pending rows for the engine and reads them back; never touches leases.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use docdispatch_engine::{DispatchJob, JobStore, NewDispatch, Pagination};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use super::common::{internal_error, not_found, ApiError, ErrorResponse, PagedResponse};

/// App state for dispatch routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

/// Query parameters for listing dispatch requests
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    /// Rows to skip; negative values count as 0
    #[serde(default)]
    pub skip: Option<i64>,
    /// Page size; defaults to 50, capped at 200
    #[serde(default)]
    pub take: Option<i64>,
}

/// Create dispatch routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/dispatch", post(create_dispatch).get(list_dispatches))
        .route("/api/dispatch/:id", get(get_dispatch))
        .with_state(state)
}

/// POST /api/dispatch - Submit a new dispatch request
#[utoipa::path(
    post,
    path = "/api/dispatch",
    request_body = NewDispatch,
    responses(
        (status = 201, description = "Dispatch request created", body = DispatchJob,
            headers(("Location" = String, description = "URL of the new dispatch request"))),
        (status = 400, description = "Missing recipient or document", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "dispatch"
)]
pub async fn create_dispatch(
    State(state): State<AppState>,
    Json(req): Json<NewDispatch>,
) -> Result<(StatusCode, [(header::HeaderName, String); 1], Json<DispatchJob>), ApiError> {
    if req.recipient_email.trim().is_empty() || req.document_name.trim().is_empty() {
        return Err(
            ErrorResponse::new("recipientEmail and documentName are required")
                .into_response(StatusCode::BAD_REQUEST),
        );
    }

    let job = state
        .store
        .create(req, Utc::now())
        .await
        .map_err(|e| internal_error("Failed to create dispatch request", e))?;

    tracing::info!(job_id = %job.id, "Dispatch request created");
    let location = format!("/api/dispatch/{}", job.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(job)))
}

/// GET /api/dispatch/:id - Get a dispatch request
#[utoipa::path(
    get,
    path = "/api/dispatch/{id}",
    params(
        ("id" = Uuid, Path, description = "Dispatch request ID")
    ),
    responses(
        (status = 200, description = "Dispatch request found", body = DispatchJob),
        (status = 404, description = "Dispatch request not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "dispatch"
)]
pub async fn get_dispatch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchJob>, ApiError> {
    let job = state
        .store
        .get(id)
        .await
        .map_err(|e| internal_error("Failed to get dispatch request", e))?
        .ok_or_else(|| not_found("dispatch request"))?;

    Ok(Json(job))
}

/// GET /api/dispatch - List dispatch requests, newest first
#[utoipa::path(
    get,
    path = "/api/dispatch",
    params(ListQuery),
    responses(
        (status = 200, description = "Page of dispatch requests", body = PagedResponse<DispatchJob>),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "dispatch"
)]
pub async fn list_dispatches(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<PagedResponse<DispatchJob>>, ApiError> {
    let page = Pagination::clamped(query.skip.unwrap_or(0), query.take.unwrap_or(50));

    let items = state
        .store
        .list(page)
        .await
        .map_err(|e| internal_error("Failed to list dispatch requests", e))?;

    Ok(Json(PagedResponse::new(page.skip, page.take, items)))
}
