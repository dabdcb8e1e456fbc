use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::breaker::BreakerError;

/// Main error type for the ratemesh service
#[derive(Debug)]
pub enum RatemeshError {
    /// Configuration or CLI argument errors
    Config(String),

    /// Malformed rate-limit requests (the only error a caller should ever see)
    InvalidRequest(String),

    /// Hash ring lookups: empty ring, unknown or duplicate node
    Routing(String),

    /// A circuit breaker refused the call
    Breaker(BreakerError),

    /// Transport layer errors
    Transport(String),

    /// Peer RPC exceeded its deadline
    Timeout(String),

    /// The caller gave up on the request
    Cancelled,

    /// A peer received the request but answered with an error
    Remote(String),

    /// Serialization/deserialization errors
    Serialization(SerializationError),

    /// System I/O errors
    Io(std::io::Error),
}

/// Serialization related errors
#[derive(Debug)]
pub enum SerializationError {
    /// JSON serialization/deserialization errors
    Json(serde_json::Error),

    /// Binary peer-protocol encoding errors
    Encode(bincode::error::EncodeError),

    /// Binary peer-protocol decoding errors
    Decode(bincode::error::DecodeError),
}

impl fmt::Display for RatemeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RatemeshError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RatemeshError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            RatemeshError::Routing(msg) => write!(f, "Routing error: {}", msg),
            RatemeshError::Breaker(err) => write!(f, "Circuit breaker: {}", err),
            RatemeshError::Transport(msg) => write!(f, "Transport error: {}", msg),
            RatemeshError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            RatemeshError::Cancelled => write!(f, "Request cancelled"),
            RatemeshError::Remote(msg) => write!(f, "Remote error: {}", msg),
            RatemeshError::Serialization(err) => write!(f, "Serialization error: {}", err),
            RatemeshError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Json(err) => write!(f, "JSON: {}", err),
            SerializationError::Encode(err) => write!(f, "Binary encode: {}", err),
            SerializationError::Decode(err) => write!(f, "Binary decode: {}", err),
        }
    }
}

impl std::error::Error for RatemeshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RatemeshError::Io(err) => Some(err),
            RatemeshError::Breaker(err) => Some(err),
            RatemeshError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Json(err) => Some(err),
            SerializationError::Encode(err) => Some(err),
            SerializationError::Decode(err) => Some(err),
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, RatemeshError>;

impl RatemeshError {
    /// Whether this error says something about the health of a downstream peer.
    /// Used as the default circuit-breaker failure predicate.
    pub fn is_downstream(&self) -> bool {
        matches!(
            self,
            RatemeshError::Transport(_)
                | RatemeshError::Timeout(_)
                | RatemeshError::Remote(_)
                | RatemeshError::Io(_)
                | RatemeshError::Serialization(SerializationError::Decode(_))
        )
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RatemeshError::Config(_) => StatusCode::BAD_REQUEST,
            RatemeshError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RatemeshError::Routing(_) => StatusCode::SERVICE_UNAVAILABLE,
            RatemeshError::Breaker(_) => StatusCode::SERVICE_UNAVAILABLE,
            RatemeshError::Transport(_) => StatusCode::BAD_GATEWAY,
            RatemeshError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RatemeshError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            RatemeshError::Remote(_) => StatusCode::BAD_GATEWAY,
            RatemeshError::Serialization(_) => StatusCode::BAD_REQUEST,
            RatemeshError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            RatemeshError::Config(_) => "configuration_error",
            RatemeshError::InvalidRequest(_) => "invalid_request",
            RatemeshError::Routing(_) => "routing_error",
            RatemeshError::Breaker(_) => "circuit_breaker",
            RatemeshError::Transport(_) => "transport_error",
            RatemeshError::Timeout(_) => "timeout",
            RatemeshError::Cancelled => "cancelled",
            RatemeshError::Remote(_) => "remote_error",
            RatemeshError::Serialization(_) => "serialization_error",
            RatemeshError::Io(_) => "io_error",
        }
    }
}

// Axum IntoResponse implementation for HTTP error responses
impl IntoResponse for RatemeshError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

// Conversions from common error types
impl From<std::io::Error> for RatemeshError {
    fn from(err: std::io::Error) -> Self {
        RatemeshError::Io(err)
    }
}

impl From<serde_json::Error> for RatemeshError {
    fn from(err: serde_json::Error) -> Self {
        RatemeshError::Serialization(SerializationError::Json(err))
    }
}

impl From<bincode::error::EncodeError> for RatemeshError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RatemeshError::Serialization(SerializationError::Encode(err))
    }
}

impl From<bincode::error::DecodeError> for RatemeshError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RatemeshError::Serialization(SerializationError::Decode(err))
    }
}

impl From<BreakerError> for RatemeshError {
    fn from(err: BreakerError) -> Self {
        RatemeshError::Breaker(err)
    }
}

impl From<tokio::time::error::Elapsed> for RatemeshError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        RatemeshError::Timeout(err.to_string())
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::RatemeshError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RatemeshError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! invalid_request {
    ($msg:expr) => {
        $crate::error::RatemeshError::InvalidRequest($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RatemeshError::InvalidRequest(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! routing_error {
    ($msg:expr) => {
        $crate::error::RatemeshError::Routing($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RatemeshError::Routing(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::RatemeshError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RatemeshError::Transport(format!($fmt, $($arg)*))
    };
}
