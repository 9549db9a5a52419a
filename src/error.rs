//! Typed error boundary: an internal error enum plus its HTTP representation.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Unauthenticated => StatusCode::UNAUTHORIZED,
            OrchestratorError::Forbidden(_) => StatusCode::FORBIDDEN,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
            OrchestratorError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidRequest(_) => "invalid_request",
            OrchestratorError::Unauthenticated => "unauthenticated",
            OrchestratorError::Forbidden(_) => "forbidden",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Conflict(_) => "conflict",
            OrchestratorError::InsufficientFunds => "insufficient_funds",
            OrchestratorError::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error_type: String,
    pub message: String,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = if matches!(self, OrchestratorError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = ErrorResponse {
            error_type: self.error_type().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
