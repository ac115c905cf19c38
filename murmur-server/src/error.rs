//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted to
//! a JSON-body HTTP response with the right status code.
//!
//! Internal errors are logged with full detail but only a generic message is
//! returned to the caller, so file paths and other implementation details
//! never leak to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use murmur_core::PoolStatus;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the murmur-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed submission: bad field, unknown model, oversized upload.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A non-terminal task with the same id already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Admission denied: the pool is at capacity.
    #[error("pool full")]
    PoolFull(PoolStatus),

    /// The caller referenced a task or result that does not exist (anymore).
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not valid in the task's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            ServerError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "bad_request", "detail": detail })),
            )
                .into_response(),
            ServerError::Conflict(detail) => (
                StatusCode::CONFLICT,
                Json(json!({ "error": "conflict", "detail": detail })),
            )
                .into_response(),
            ServerError::PoolFull(pool) => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "pool_full", "pool": pool })),
            )
                .into_response(),
            ServerError::NotFound(detail) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found", "detail": detail })),
            )
                .into_response(),
            ServerError::InvalidState(detail) => (
                StatusCode::CONFLICT,
                Json(json!({ "error": "invalid_state", "detail": detail })),
            )
                .into_response(),
            ServerError::Internal(detail) => {
                // Full detail stays in the log; clients get a generic body.
                error!(detail = %detail, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal_error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<murmur_core::StoreError> for ServerError {
    fn from(e: murmur_core::StoreError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}
