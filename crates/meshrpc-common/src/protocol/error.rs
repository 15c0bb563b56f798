use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error codes carried in [`ErrorData`] on the wire.
pub mod codes {
    /// The request payload could not be decoded into the declared type.
    pub const BAD_PAYLOAD: i32 = 400;
    /// No handler (server side) or no endpoint (client side) for the qualifier.
    pub const SERVICE_NOT_FOUND: i32 = 404;
    /// The service method itself failed.
    pub const APPLICATION: i32 = 500;
    /// The channel failed while the exchange was in flight.
    pub const TRANSPORT: i32 = 503;
    /// A deadline expired.
    pub const TIMEOUT: i32 = 504;
}

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Invalid qualifier: {0}")]
    InvalidQualifier(String),

    #[error("No reachable member with such service: {0}")]
    ServiceNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Application error {code}: {message}")]
    Application { code: i32, message: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Creates an application-level error with an explicit code.
    pub fn application(code: i32, message: impl Into<String>) -> Self {
        MeshError::Application {
            code,
            message: message.into(),
        }
    }

    /// Returns `true` when the error is a client-side deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MeshError::Timeout(_))
    }

    /// Returns `true` for failures a caller may reasonably retry.
    ///
    /// The invocation pipeline never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Transport(_) | MeshError::Connection(_) | MeshError::Timeout(_)
        )
    }

    /// Converts the error into the structured form sent back to callers.
    pub fn error_data(&self) -> ErrorData {
        let code = match self {
            MeshError::Application { code, .. } => *code,
            MeshError::ServiceNotFound(_) => codes::SERVICE_NOT_FOUND,
            MeshError::Codec(_) | MeshError::JsonSerialization(_) | MeshError::InvalidQualifier(_) => {
                codes::BAD_PAYLOAD
            }
            MeshError::Transport(_) | MeshError::Connection(_) | MeshError::Io(_) => codes::TRANSPORT,
            MeshError::Timeout(_) => codes::TIMEOUT,
            MeshError::Definition(_) => codes::APPLICATION,
        };
        let message = match self {
            MeshError::Application { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorData::new(code, message)
    }

    /// Rebuilds a caller-side error from a remote error payload.
    ///
    /// A remote "not found" stays distinguishable from application failures.
    pub fn from_error_data(qualifier: &str, data: ErrorData) -> Self {
        match data.code {
            codes::SERVICE_NOT_FOUND => MeshError::ServiceNotFound(qualifier.to_string()),
            code => MeshError::Application {
                code,
                message: data.message,
            },
        }
    }
}

/// Error payload of a failed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: i32,
    pub message: String,
}

impl ErrorData {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorData{{code={}, message='{}'}}", self.code, self.message)
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
