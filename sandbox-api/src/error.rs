use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sandbox_orchestrator::OrchestratorError;
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

pub type ApiResult<T> = Result<T, ApiError>;

/// Body of every error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(id) => ApiError::NotFound(format!("Project not found: {id}")),
            OrchestratorError::InvalidInput(msg) => ApiError::BadRequest(msg),
            OrchestratorError::Conflict(msg) | OrchestratorError::InvalidState(msg) => {
                ApiError::Conflict(msg)
            }
            _ => {
                error!("Request failed: {}", err);
                ApiError::Internal(err.to_string())
            }
        }
    }
}
