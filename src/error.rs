//! Error types for media-dl
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (queue state, engines, rules, persistence)
//! - HTTP status code mapping for API integration
//! - Structured error responses with machine-readable error codes

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for media-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent_downloads")
        key: Option<String>,
    },

    /// Queue item state-machine error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Rule document error (unknown field, operator, or action)
    #[error("rule error: {0}")]
    Rule(String),

    /// No engine adapter claims the URL, or the chosen adapter is unavailable
    #[error("no engine available: {0}")]
    EngineUnavailable(String),

    /// Queue store operation failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// SQLx database error
    #[error("store error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Item, playlist, or rule not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Status machine violation detected at runtime
    #[error("internal invariant violation: {0}")]
    InvariantViolation(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Queue state-machine errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Item not found in the queue
    #[error("item {id} not found")]
    NotFound {
        /// The item id that was not found
        id: String,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} item {id} in state {current_state}")]
    InvalidState {
        /// The item id in an invalid state for the operation
        id: String,
        /// The operation that was attempted (e.g., "pause", "resume")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },
}

/// Queue store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store
    #[error("failed to connect to queue store: {0}")]
    ConnectionFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Persisted record could not be decoded
    #[error("corrupt record for key {key}: {reason}")]
    CorruptRecord {
        /// The store key whose value failed to decode
        key: String,
        /// Decode failure detail
        reason: String,
    },
}

/// API error response format
///
/// Returned by API endpoints when an error occurs: a machine-readable code,
/// a human-readable message, and optional contextual details.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "not_found",
///     "message": "item 1f2e3d not found"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "validation_error")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create a "validation error" error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }

    /// Create a "conflict" error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    /// Create an "internal server error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        ApiError::new(code, error.to_string())
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - invalid input
            Error::Config { .. } | Error::Rule(_) => 400,

            // 404 Not Found
            Error::NotFound(_) | Error::Queue(QueueError::NotFound { .. }) => 404,

            // 409 Conflict - operation invalid in current state
            Error::Queue(QueueError::InvalidState { .. }) => 409,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,

            // 422 Unprocessable Entity - URL that no engine can fetch
            Error::EngineUnavailable(_) => 422,

            // 500 Internal Server Error
            Error::Store(_)
            | Error::Sqlx(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::ApiServerError(_)
            | Error::InvariantViolation(_)
            | Error::Other(_) => 500,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "configuration_invalid",
            Error::Rule(_) => "rule_invalid",
            Error::Queue(QueueError::NotFound { .. }) | Error::NotFound(_) => "not_found",
            Error::Queue(QueueError::InvalidState { .. }) => "invalid_state",
            Error::EngineUnavailable(_) => "engine_unavailable",
            Error::ShuttingDown => "shutting_down",
            Error::Store(_) | Error::Sqlx(_) => "store_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::Other(_) => "internal_error",
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_not_found_maps_to_404() {
        let err = Error::Queue(QueueError::NotFound { id: "abc".into() });
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.error_code(), "not_found");
    }

    #[test]
    fn invalid_state_maps_to_409() {
        let err = Error::Queue(QueueError::InvalidState {
            id: "abc".into(),
            operation: "resume".into(),
            current_state: "downloading".into(),
        });
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.error_code(), "invalid_state");
    }

    #[test]
    fn config_error_maps_to_400() {
        let err = Error::Config {
            message: "max_concurrent_downloads must be >= 1".into(),
            key: Some("max_concurrent_downloads".into()),
        };
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.error_code(), "configuration_invalid");
    }

    #[test]
    fn engine_unavailable_maps_to_422() {
        let err = Error::EngineUnavailable("https://example.com/x".into());
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn shutting_down_maps_to_503() {
        assert_eq!(Error::ShuttingDown.status_code(), 503);
    }

    #[test]
    fn invariant_violation_maps_to_500() {
        let err = Error::InvariantViolation("completed item re-admitted".into());
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.error_code(), "invariant_violation");
    }

    #[test]
    fn invalid_state_message_names_operation_and_state() {
        let err = QueueError::InvalidState {
            id: "1f2e".into(),
            operation: "pause".into(),
            current_state: "completed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pause"));
        assert!(msg.contains("completed"));
        assert!(msg.contains("1f2e"));
    }

    #[test]
    fn api_error_serializes_without_null_details() {
        let err = ApiError::not_found("item 123");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"not_found\""));
        assert!(!json.contains("details"));
    }
}
