//! Error types for plant-mirror-sync.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for plant-mirror-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Source database connection error
    #[error("Source connection error: {message}")]
    SourceConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// Source database query error
    #[error("Source query error on stream '{stream}': {message}")]
    SourceQuery {
        /// Stream key
        stream: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// A query aimed at the source contained a mutating statement
    #[error("Refusing to run mutating statement against the source ('{verb}' found)")]
    ReadOnlyViolation {
        /// Offending keyword
        verb: String,
    },

    /// Mirror database connection error
    #[error("Mirror connection error: {message}")]
    MirrorConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<duckdb::Error>,
    },

    /// Mirror database query or transaction error
    #[error("Mirror query error on table '{table}': {message}")]
    MirrorQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<duckdb::Error>,
    },

    /// An operation exceeded its time budget
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// What was being attempted
        operation: String,
        /// Budget that elapsed
        after: Duration,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure classes used for logging and for deciding what a failure means for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Missing or invalid configuration; fatal at startup
    Configuration,
    /// Endpoint unreachable or timed out; retried on the next tick
    TransientConnectivity,
    /// Constraint violation or commit failure; the whole batch rolls back
    Transaction,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Configuration => "ConfigurationError",
            ErrorClass::TransientConnectivity => "TransientConnectivityError",
            ErrorClass::Transaction => "TransactionError",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a source connection error.
    pub fn source_connection(message: impl Into<String>, source: tokio_postgres::Error) -> Self {
        Self::SourceConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a source query error.
    pub fn source_query(
        stream: impl Into<String>,
        message: impl Into<String>,
        source: tokio_postgres::Error,
    ) -> Self {
        Self::SourceQuery {
            stream: stream.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a mirror connection error.
    pub fn mirror_connection(message: impl Into<String>, source: duckdb::Error) -> Self {
        Self::MirrorConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a mirror query error.
    pub fn mirror_query(
        table: impl Into<String>,
        message: impl Into<String>,
        source: duckdb::Error,
    ) -> Self {
        Self::MirrorQuery {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config { .. } | Error::Validation(_) | Error::ReadOnlyViolation { .. } => {
                ErrorClass::Configuration
            }
            Error::SourceConnection { .. }
            | Error::SourceQuery { .. }
            | Error::MirrorConnection { .. }
            | Error::Timeout { .. }
            | Error::Io(_) => ErrorClass::TransientConnectivity,
            Error::MirrorQuery { .. } => ErrorClass::Transaction,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Configuration
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::SourceConnection { .. } => "SOURCE_CONNECTION_ERROR",
            Error::SourceQuery { .. } => "SOURCE_QUERY_ERROR",
            Error::ReadOnlyViolation { .. } => "READ_ONLY_VIOLATION",
            Error::MirrorConnection { .. } => "MIRROR_CONNECTION_ERROR",
            Error::MirrorQuery { .. } => "MIRROR_QUERY_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Io(_) => "IO_ERROR",
        }
    }
}
