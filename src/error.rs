use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the service outside the admission path.
#[derive(Debug, Error)]
pub enum EventGateError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EventGateError>;

impl From<validator::ValidationErrors> for EventGateError {
    fn from(err: validator::ValidationErrors) -> Self {
        EventGateError::Validation(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &EventGateError) -> Self {
        match err {
            EventGateError::Configuration(msg) => Self::new("configuration_error", msg, 500),
            EventGateError::InvalidRequest(msg) => Self::new("bad_request", msg, 400),
            EventGateError::Validation(msg) => Self::new("validation_error", msg, 422),
            EventGateError::NotFound(msg) => Self::new("not_found", msg, 404),
            EventGateError::Store(StoreError::Empty) => {
                Self::new("not_found", "no events recorded", 404)
            }
            EventGateError::Store(_) => Self::new("internal_error", "it's our fault, not yours!", 500),
            EventGateError::Watch(err) => Self::new("service_unavailable", &err.to_string(), 503),
            EventGateError::Internal(_) => Self::new("internal_error", "it's our fault, not yours!", 500),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for EventGateError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        if body.code >= 500 {
            tracing::error!(error = %self, "request failed");
        }
        (body.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (EventGateError::InvalidRequest("x".into()), 400),
            (EventGateError::Validation("x".into()), 422),
            (EventGateError::NotFound("x".into()), 404),
            (EventGateError::Store(StoreError::Empty), 404),
            (EventGateError::Internal("boom".into()), 500),
        ];

        for (err, code) in cases {
            assert_eq!(ErrorResponse::from_error(&err).code, code, "{err}");
        }
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let body = ErrorResponse::from_error(&EventGateError::Internal("db password".into()));
        assert!(!body.message.contains("password"));
    }
}
