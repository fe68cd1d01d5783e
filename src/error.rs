//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: HTTP-facing failures, converted to JSON responses for the REST endpoints
//! - **ProtocolError**: Failures inside a WebSocket session. None of them are fatal to the
//!   server; each one is either turned into an `Error` frame for the client or logged when
//!   the session is torn down.
//!
//! ## Protocol Error Taxonomy:
//! | Variant | Recovery |
//! |---|---|
//! | `MalformedFrame` | `Error` frame, connection stays open |
//! | `EmptyUtterance` | `Error` frame "No audio data received", no pipeline call |
//! | `PipelineFailure` | `Error` frame with the failure message, buffer cleared |
//! | `UtteranceTooLarge` | `Error` frame once per utterance, further chunks dropped |
//! | `TransportFailure` | Not surfaced (no channel left), session teardown |

use crate::pipeline::PipelineError;
use crate::protocol::FrameError;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Message sent to the client when `AudioEnd` arrives with nothing buffered.
pub const EMPTY_UTTERANCE_MESSAGE: &str = "No audio data received";

/// Custom error types for the HTTP side of the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: Capacity exhausted, e.g. the session limit (503 errors)
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

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl AppError {
    fn status_and_type(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.as_str()),
        }
    }
}

/// Converts errors into JSON bodies of the form
/// `{"error": {"type": ..., "message": ..., "timestamp": ...}}`.
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.status_and_type().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.status_and_type();

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

/// JSON parsing errors are almost always the client's fault, so they map to 400.
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

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityReached(_) => AppError::Unavailable(err.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures inside a single protocol session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Error processing message: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("{}", EMPTY_UTTERANCE_MESSAGE)]
    EmptyUtterance,

    #[error("{0}")]
    PipelineFailure(#[from] PipelineError),

    #[error("Audio exceeds the maximum utterance size of {limit} bytes")]
    UtteranceTooLarge { limit: usize },

    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl ProtocolError {
    /// Whether the client should hear about this error via an `Error` frame.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, ProtocolError::TransportFailure(_))
    }
}

/// Session registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Maximum concurrent sessions ({0}) reached")]
    CapacityReached(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_messages() {
        assert_eq!(ProtocolError::EmptyUtterance.to_string(), "No audio data received");
        assert_eq!(EMPTY_UTTERANCE_MESSAGE, "No audio data received");

        let malformed = ProtocolError::from(FrameError::TooShort { len: 0 });
        assert_eq!(
            malformed.to_string(),
            "Error processing message: message too short: 0 bytes, need at least 5"
        );

        let pipeline = ProtocolError::from(PipelineError::Transcription("timeout".to_string()));
        assert_eq!(pipeline.to_string(), "Transcription failed: timeout");
    }

    #[test]
    fn test_transport_failures_are_not_reported() {
        assert!(!ProtocolError::TransportFailure("closed".into()).is_reportable());
        assert!(ProtocolError::EmptyUtterance.is_reportable());
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::from(RegistryError::CapacityReached(2)).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
