use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed cause carried by operation failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for plcbench
#[derive(Error, Debug)]
pub enum BenchError {
    /// The adapter could not establish or lost its session with the controller.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single write/read/bulk call was rejected or timed out.
    #[error("Operation '{operation}' failed: {source}")]
    Operation {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl BenchError {
    /// Operation failure from a plain message
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        BenchError::Operation {
            operation: operation.into(),
            source: message.into(),
        }
    }

    /// Operation failure wrapping an underlying cause
    pub fn operation_cause<E>(operation: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BenchError::Operation {
            operation: operation.into(),
            source: Box::new(cause),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        BenchError::Connection(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        BenchError::Config(message.into())
    }

    /// Coarse classification used in samples and reports
    pub fn kind(&self) -> ErrorKind {
        match self {
            BenchError::Connection(_) => ErrorKind::Connection,
            BenchError::Config(_) => ErrorKind::Configuration,
            BenchError::Cancelled => ErrorKind::Cancelled,
            BenchError::Operation { .. } | BenchError::Io(_) | BenchError::Serialization(_) => {
                ErrorKind::Operation
            }
        }
    }

    /// Whether the failure ends the current scenario run
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Cancelled)
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(err: serde_json::Error) -> Self {
        BenchError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BenchError {
    fn from(err: toml::de::Error) -> Self {
        BenchError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for BenchError {
    fn from(err: toml::ser::Error) -> Self {
        BenchError::Serialization(err.to_string())
    }
}

/// Error classification recorded on failed samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Operation,
    Configuration,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Operation => write!(f, "operation"),
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
