// Common DTOs for the HTTP API
//
// These types are shared across multiple endpoints.

use axum::http::StatusCode;
use axum::Json;
use docdispatch_engine::StoreError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// Convert to axum response tuple
    pub fn into_response(self, status: StatusCode) -> (StatusCode, Json<Self>) {
        (status, Json(self))
    }
}

/// Error half of every handler's result
pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Log a store failure and map it to 500
pub fn internal_error(context: &str, e: StoreError) -> ApiError {
    tracing::error!("{}: {}", context, e);
    ErrorResponse::new("internal server error").into_response(StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn not_found(what: &str) -> ApiError {
    ErrorResponse::new(format!("{} not found", what)).into_response(StatusCode::NOT_FOUND)
}

/// Page of results with the effective paging parameters
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PagedResponse<T> {
    pub skip: u32,
    pub take: u32,
    /// Number of items in this page
    pub count: usize,
    pub items: Vec<T>,
}

impl<T> PagedResponse<T> {
    pub fn new(skip: u32, take: u32, items: Vec<T>) -> Self {
        Self {
            skip,
            take,
            count: items.len(),
            items,
        }
    }
}
