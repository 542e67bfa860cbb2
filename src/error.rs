//! # Error Handling
//!
//! This module defines the two error families used by the gateway and how they
//! reach the outside world:
//!
//! - **`SessionError`**: everything that can go wrong while a speech session is
//!   being created, driven or torn down. These errors never cross a process
//!   boundary as HTTP responses; they are normalized into `error` /
//!   `synthesis_error` events for the originating client only.
//! - **`AppError`**: errors returned by the HTTP handlers (`/api/v1/...`). They
//!   implement actix's `ResponseError` so a handler can simply return
//!   `Result<HttpResponse, AppError>`.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **T**: The success type (what you get when everything works)
//! - **E**: The error type (what you get when something goes wrong)
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### thiserror
//! - **`#[derive(Error)]`**: Generates the `std::error::Error` impl
//! - **`#[error("...")]`**: Generates the `Display` impl from a format string
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types (enables `?`)
//! - **ResponseError trait**: Converts errors to HTTP responses

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Failures of a speech session.
///
/// ## Taxonomy:
/// - **Configuration**: missing or invalid credentials / upstream URLs. Fatal, never retried.
/// - **UpstreamConnect**: the upstream transport could not be established (includes timeouts).
/// - **UpstreamProtocol**: the upstream answered with a non-zero status code.
/// - **MalformedFrame**: the upstream sent something the protocol adapter cannot decode.
/// - **UpstreamTransport**: the connection broke (or closed early) after it was established.
/// - **ClientInput**: the client sent something unusable (empty text, bad audio frame, ...).
/// - **Busy**: a synthesis is already streaming for this client.
/// - **Capacity**: the server-wide session limit has been reached.
/// - **InvalidTransition**: the session's state machine rejected the request.
///
/// ## Rust Concepts:
/// - **Clone**: Errors are cloned into client events and log lines
/// - **PartialEq**: Lets tests compare errors with `assert_eq!`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream error {code}: {message}")]
    UpstreamProtocol { code: i64, message: String },

    #[error("malformed upstream frame: {0}")]
    MalformedFrame(String),

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("invalid input: {0}")]
    ClientInput(String),

    #[error("session {session_id} is still in progress")]
    Busy { session_id: String },

    #[error("session limit of {0} reached")]
    Capacity(usize),

    #[error("cannot {action} while session is {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
}

impl SessionError {
    /// Errors caused by the client's own request.
    ///
    /// These are rejected synchronously and leave the session untouched;
    /// every other error tears the session down.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            SessionError::ClientInput(_)
                | SessionError::Busy { .. }
                | SessionError::Capacity(_)
                | SessionError::InvalidTransition { .. }
        )
    }

    /// Short machine-readable name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Configuration(_) => "configuration",
            SessionError::UpstreamConnect(_) => "upstream_connect",
            SessionError::UpstreamProtocol { .. } => "upstream_protocol",
            SessionError::MalformedFrame(_) => "malformed_frame",
            SessionError::UpstreamTransport(_) => "upstream_transport",
            SessionError::ClientInput(_) => "client_input",
            SessionError::Busy { .. } => "busy",
            SessionError::Capacity(_) => "capacity",
            SessionError::InvalidTransition { .. } => "invalid_transition",
        }
    }
}

/// Custom error types for the HTTP surface of the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **Conflict**: The request collides with work already in flight (409 errors)
/// - **Unavailable**: The server is at capacity (503 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::NotFound(format!("client {} is not connected", id)));
/// ```
#[derive(Debug, Error)]
pub enum AppError {
    /// Internal server errors (upstream failures, poisoned state, etc.)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Requested resource was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request conflicts with an operation already in progress
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The server cannot take more work right now
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// User input failed validation rules
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - Conflict → 409 (Conflict)
/// - Unavailable → 503 (Service Unavailable)
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "conflict",
///     "message": "session ... is still in progress",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Session failures reaching an HTTP handler (the synthesis trigger endpoint).
///
/// ## Why the split:
/// Client faults become 4xx responses so the caller can fix the request;
/// everything else is the server's (or the upstream's) problem.
impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ClientInput(_) | SessionError::InvalidTransition { .. } => {
                AppError::ValidationError(err.to_string())
            }
            SessionError::Busy { .. } => AppError::Conflict(err.to_string()),
            SessionError::Capacity(_) => AppError::Unavailable(err.to_string()),
            SessionError::Configuration(_) => AppError::ConfigError(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

/// Type alias for Results that use the HTTP error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_client_faults_are_not_fatal() {
        assert!(SessionError::ClientInput("empty".into()).is_client_fault());
        assert!(SessionError::Busy { session_id: "s".into() }.is_client_fault());
        assert!(!SessionError::UpstreamConnect("refused".into()).is_client_fault());
        assert!(!SessionError::UpstreamProtocol { code: 10163, message: "bad".into() }.is_client_fault());
    }

    #[test]
    fn test_session_error_status_mapping() {
        let busy = SessionError::Busy { session_id: "abc".into() };
        assert_eq!(busy.to_string(), "session abc is still in progress");
        let busy: AppError = busy.into();
        assert_eq!(busy.error_response().status(), StatusCode::CONFLICT);

        let empty: AppError = SessionError::ClientInput("text must not be empty".into()).into();
        assert_eq!(empty.error_response().status(), StatusCode::BAD_REQUEST);

        let full: AppError = SessionError::Capacity(10).into();
        assert_eq!(full.error_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        let upstream: AppError = SessionError::UpstreamTransport("reset".into()).into();
        assert_eq!(upstream.error_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_upstream_protocol_message() {
        let err = SessionError::UpstreamProtocol { code: 10313, message: "appid mismatch".into() };
        assert_eq!(err.to_string(), "upstream error 10313: appid mismatch");
        assert_eq!(err.kind(), "upstream_protocol");
    }
}
