//! Protocol error mapping. API errors never touch workflow state.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::scheduler::ApproveError;

/// Errors surfaced to HTTP clients
#[derive(Debug)]
pub enum ApiError {
    /// Unknown task / agent / question / workflow
    NotFound(String),
    /// The resource is not in the expected state
    Conflict(String),
    /// Something environmental went wrong server-side
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Conflict(message) => (StatusCode::CONFLICT, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (code, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ApproveError> for ApiError {
    fn from(e: ApproveError) -> Self {
        match e {
            ApproveError::NotFound(id) => Self::NotFound(format!("no workflow for {id}")),
            ApproveError::NotPendingMerge(_) => Self::Conflict(e.to_string()),
            ApproveError::Environment(message) => Self::Internal(message),
        }
    }
}
