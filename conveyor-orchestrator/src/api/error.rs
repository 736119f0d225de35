//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use conveyor_core::domain::approval::ApprovalError;

use crate::repository::RepositoryError;
use crate::service::CoordinatorError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    RepositoryError(RepositoryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::RepositoryError(err) => {
                tracing::error!("Repository error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::NotFound(_) => ApiError::NotFound(err.to_string()),
            CoordinatorError::RunConflict { .. } | CoordinatorError::AlreadyTerminal { .. } => {
                ApiError::Conflict(err.to_string())
            }
            CoordinatorError::MissingArtifact { .. } | CoordinatorError::InvalidArtifact(_) => {
                ApiError::BadRequest(err.to_string())
            }
            CoordinatorError::Repository(err) => ApiError::RepositoryError(err),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ApprovalError::Closed { .. } => ApiError::Conflict(err.to_string()),
            ApprovalError::EmptyIdentity => ApiError::BadRequest(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
