use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::job::JobResult;
use crate::service::ServiceError;
use crate::workspace::WorkspaceError;

/// Error type returned by every handler
///
/// Authorization, validation and admission failures get a `{"detail": ...}`
/// body; anything that went wrong after admission is reported as a failed
/// [`JobResult`] so callers always get the result shape back.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Job failed: {}", .0.stderr)]
    JobFailed(JobResult),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Unauthorized(_) => {
                ApiError::Unauthorized("Could not validate credentials".to_string())
            }
            ServiceError::Validation(msg) => ApiError::BadRequest(msg),
            ServiceError::RateLimited { retry_after } => ApiError::RateLimited {
                retry_after_secs: retry_after.as_secs_f64().ceil().max(1.0) as u64,
            },
            ServiceError::Workspace(
                e @ (WorkspaceError::PathEscape(_) | WorkspaceError::StorageLimitExceeded { .. }),
            ) => ApiError::BadRequest(e.to_string()),
            ServiceError::Workspace(e) => {
                error!("Workspace failure: {}", e);
                ApiError::JobFailed(JobResult::failure(format!("Internal error: {}", e)))
            }
            ServiceError::EngineFailed(result) => ApiError::JobFailed(result),
            ServiceError::Internal(msg) => {
                error!("Internal failure: {}", msg);
                ApiError::JobFailed(JobResult::failure(format!("Internal error: {}", msg)))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(detail) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"))],
                Json(json!({ "detail": detail })),
            )
                .into_response(),
            ApiError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
            }
            ApiError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, HeaderValue::from(retry_after_secs))],
                Json(json!({
                    "detail": format!("Too many jobs. Retry after {} seconds", retry_after_secs),
                })),
            )
                .into_response(),
            ApiError::JobFailed(result) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(result)).into_response()
            }
        }
    }
}
