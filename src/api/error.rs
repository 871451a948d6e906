//! HTTP error mapping

use crate::core::RouterError;
use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error kind, e.g. `CircuitOpenError`
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError(pub RouterError);

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(RouterError::Validation(rejection.body_text()))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RouterError::Validation(_) => StatusCode::BAD_REQUEST,
            RouterError::UnavailableShard(_) | RouterError::CircuitOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RouterError::QueryExecution(_)
            | RouterError::TransactionAbort { .. }
            | RouterError::Config(_)
            | RouterError::Lock(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for handlers
pub type Result<T> = std::result::Result<T, ApiError>;
