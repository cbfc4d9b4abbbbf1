//! WolfMirror Error Types

use serde::Serialize;
use thiserror::Error;

/// Result type alias for WolfMirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMirror error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Input errors
    #[error("Invalid operation: {0}")]
    Input(String),

    #[error("Malformed JSON input: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported operation: {operation}")]
    UnsupportedOperation { operation: String, collection: String },

    // Replica errors
    #[error("Endpoint not configured for replica {0}")]
    EndpointUnresolved(String),

    #[error("Connection timeout to {target} after {timeout_ms}ms")]
    ConnectionTimeout { target: String, timeout_ms: u64 },

    #[error("Connection error for {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },

    /// Failure reported by the document store, message kept verbatim
    #[error("{0}")]
    Operation(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure taxonomy recorded on per-replica outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or missing operation descriptor
    Input,
    /// Replica endpoint could not be resolved
    Configuration,
    /// Connection not established within the allotted window
    ConnectionTimeout,
    /// Connection attempt failed before the timeout
    Connection,
    /// The store rejected or failed the dispatched action
    Operation,
    /// Descriptor kind is not a recognized operation
    UnsupportedOperation,
}

impl FailureKind {
    /// Short label used in reports
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Input => "input",
            FailureKind::Configuration => "configuration",
            FailureKind::ConnectionTimeout => "connection_timeout",
            FailureKind::Connection => "connection",
            FailureKind::Operation => "operation",
            FailureKind::UnsupportedOperation => "unsupported_operation",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl Error {
    /// Classify this error into the outcome taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Input(_) | Error::Json(_) => FailureKind::Input,
            Error::Config(_) | Error::ConfigParse(_) | Error::EndpointUnresolved(_) => {
                FailureKind::Configuration
            }
            Error::UnsupportedOperation { .. } => FailureKind::UnsupportedOperation,
            Error::ConnectionTimeout { .. } => FailureKind::ConnectionTimeout,
            Error::ConnectionFailed { .. } => FailureKind::Connection,
            Error::Operation(_) | Error::Io(_) | Error::Internal(_) => FailureKind::Operation,
        }
    }

    /// Check if this error must abort the whole job before any replica is touched
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Input(_) | Error::Json(_) | Error::Config(_) | Error::ConfigParse(_)
        )
    }

    /// Wrap a store failure, keeping its message
    pub fn operation(message: impl std::fmt::Display) -> Self {
        Error::Operation(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            Error::EndpointUnresolved("ins1".into()).kind(),
            FailureKind::Configuration
        );
        assert_eq!(
            Error::ConnectionTimeout { target: "ins1".into(), timeout_ms: 10 }.kind(),
            FailureKind::ConnectionTimeout
        );
        assert_eq!(Error::operation("E11000").kind(), FailureKind::Operation);
        assert_eq!(
            Error::UnsupportedOperation {
                operation: "bulkWrite".into(),
                collection: "students".into(),
            }
            .kind(),
            FailureKind::UnsupportedOperation
        );
    }

    #[test]
    fn test_operation_message_is_verbatim() {
        let err = Error::operation("E11000 duplicate key error");
        assert_eq!(err.to_string(), "E11000 duplicate key error");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::Input("missing collection".into()).is_fatal());
        assert!(!Error::EndpointUnresolved("ins1".into()).is_fatal());
        assert!(!Error::operation("boom").is_fatal());
    }
}
