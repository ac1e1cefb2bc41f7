//! Maps [`DomainError`] onto the HTTP error taxonomy the handlers promise
//! (§6.2, §7): 400 invalid input, 404 unknown id, 409 conflict, 500 the rest.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::domain::errors::DomainError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] DomainError),
}

impl From<&str> for ApiError {
    fn from(msg: &str) -> Self {
        Self::BadRequest(msg.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::Internal(DomainError::TaskNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("task not found: {id}"))
            }
            Self::Internal(DomainError::InvocationNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("invocation not found: {id}"))
            }
            Self::Internal(DomainError::InvalidPhaseTransition { from, to }) => (
                StatusCode::CONFLICT,
                format!("invalid phase transition from {from} to {to}"),
            ),
            Self::Internal(DomainError::ValidationFailed(msg)) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            Self::Internal(DomainError::ConcurrencyConflict { entity, id }) => (
                StatusCode::CONFLICT,
                format!("{entity} {id} was modified concurrently"),
            ),
            Self::Internal(err) => {
                tracing::error!(error = %err, "unhandled domain error reached the api boundary");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
