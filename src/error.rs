//! Error types for tgraph
//!
//! This module provides the error taxonomy shared by every stage of the pipeline:
//! - Transport failures that may be retried (timeouts)
//! - Business errors reported by the Tautulli API (never retried)
//! - Malformed responses and structurally invalid data
//! - Orchestration failures and expired deadlines
//!
//! Each variant carries a machine-readable code (see [`Error::error_code`]) which is
//! attached to progress updates and cycle reports.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for tgraph operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tgraph
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "tautulli.api_key")
        key: Option<String>,
    },

    /// Transient transport failure (request timeout) that outlived its retries
    #[error("transient error: {0}")]
    Transient(String),

    /// The API answered with `result: "error"`
    #[error("API error for command '{command}': {message}")]
    Api {
        /// API command that was rejected
        command: String,
        /// Server-supplied error message
        message: String,
    },

    /// Response body did not have the expected shape
    #[error("invalid API response format: {0}")]
    Format(String),

    /// Structurally invalid input or output data
    #[error("validation error: {0}")]
    Validation(String),

    /// Unrecoverable failure at the orchestration level
    #[error("pipeline error: {message}")]
    Pipeline {
        /// Description of the failed stage
        message: String,
        /// Underlying failure, if any
        #[source]
        source: Option<Box<Error>>,
    },

    /// A bounded wait expired
    #[error("{operation} exceeded timeout of {} seconds", .timeout.as_secs_f64())]
    Timeout {
        /// Name of the operation that was waited on
        operation: String,
        /// Deadline that expired
        timeout: Duration,
    },

    /// Operation aborted through its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error (connection refused, HTTP status, body decoding)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse or emit error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// File watching error
    #[error("file watch error: {0}")]
    FileWatch(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a [`Error::Pipeline`] wrapping an underlying failure
    pub fn pipeline(message: impl Into<String>, source: Error) -> Self {
        Error::Pipeline {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build a [`Error::Config`] for a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Whether this error is (or wraps) an expired deadline
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Pipeline {
                source: Some(inner),
                ..
            } => inner.is_timeout(),
            _ => false,
        }
    }

    /// Get the machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Transient(_) => "transient_error",
            Error::Api { .. } => "api_error",
            Error::Format(_) => "format_error",
            Error::Validation(_) => "validation_error",
            Error::Pipeline { .. } => "pipeline_error",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::Yaml(_) => "yaml_error",
            Error::FileWatch(_) => "file_watch_error",
            Error::Other(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn timeout_message_names_operation_and_deadline() {
        let err = Error::Timeout {
            operation: "Graph generation".to_string(),
            timeout: Duration::from_millis(1500),
        };

        assert_eq!(
            err.to_string(),
            "Graph generation exceeded timeout of 1.5 seconds"
        );
        assert!(err.is_timeout());
        assert_eq!(err.error_code(), "timeout");
    }

    #[test]
    fn pipeline_error_exposes_its_source() {
        let err = Error::pipeline(
            "failed to fetch data after 4 attempts",
            Error::Transient("request timed out".to_string()),
        );

        assert_eq!(
            err.to_string(),
            "pipeline error: failed to fetch data after 4 attempts"
        );
        let source = err.source().map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("transient error: request timed out")
        );
        assert!(!err.is_timeout());
    }

    #[test]
    fn pipeline_wrapping_timeout_is_still_a_timeout() {
        let err = Error::pipeline(
            "cycle aborted",
            Error::Timeout {
                operation: "Cycle".to_string(),
                timeout: Duration::from_secs(1),
            },
        );
        assert!(err.is_timeout());
    }

    #[test]
    fn api_error_includes_command_and_server_message() {
        let err = Error::Api {
            command: "get_history".to_string(),
            message: "Invalid apikey".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "API error for command 'get_history': Invalid apikey"
        );
        assert_eq!(err.error_code(), "api_error");
    }

    #[test]
    fn config_helper_records_key() {
        match Error::config("keep_days", "must be between 1 and 365") {
            Error::Config { message, key } => {
                assert_eq!(message, "must be between 1 and 365");
                assert_eq!(key.as_deref(), Some("keep_days"));
            }
            other => panic!("expected Config error, got {other:?}"),
        }
    }
}
