//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`SessionError`]: Everything that can go wrong while a carrier connection is being
//!   served. These never reach an HTTP client; the session boundary logs them and
//!   decides whether the call continues.
//! - [`AppError`]: Failures of the small HTTP surface (health, config), rendered as
//!   JSON error bodies through actix-web's `ResponseError`.
//!
//! ## Key Rust Concepts:
//! - **thiserror**: `#[derive(Error)]` writes the `Display` and `std::error::Error`
//!   impls from the `#[error(...)]` attributes
//! - **From trait**: Lets `?` convert library errors into our own types

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors raised while serving one carrier connection.
///
/// ## Handling Policy:
/// - **MalformedMessage**: Log and drop the frame, keep the connection
/// - **DuplicateConnection / SessionLimit**: Reject session creation, close the connection
/// - **SendFailure**: Abort playback, stop the session, release its resources
/// - **NotFound / Closed**: The session is already gone, nothing left to do
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Raw text from the carrier was not a JSON object
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A live session already exists for this connection identity
    #[error("duplicate connection: {0}")]
    DuplicateConnection(String),

    /// No live session for this connection identity
    #[error("session not found: {0}")]
    NotFound(String),

    /// Registry is at its configured capacity
    #[error("maximum concurrent sessions ({0}) reached")]
    SessionLimit(usize),

    /// The transport could not take an outbound frame
    #[error("failed to send frame: {0}")]
    SendFailure(String),

    /// The session task has finished and accepts no more input
    #[error("session closed: {0}")]
    Closed(String),
}

/// Errors returned by the HTTP handlers.
///
/// ## Status Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, &str) {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
        }
    }
}

/// Converts errors into JSON responses of the form:
/// ```json
/// { "error": { "type": "validation_error", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON problems are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => AppError::NotFound(format!("session {}", id)),
            other => AppError::Internal(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::ConfigError("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_session_not_found_becomes_404() {
        let err: AppError = SessionError::NotFound("conn_1".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: AppError = SessionError::SessionLimit(3).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("(3)"));
    }
}
