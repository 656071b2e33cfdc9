//! Error taxonomy for engine operations and configuration loading

use std::path::PathBuf;
use thiserror::Error;

/// Failure of a task engine operation.
///
/// The variant decides how a transport maps the failure; the message is
/// always human readable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Malformed, absent or invalid input. Never retried.
    #[error("{0}")]
    BadRequest(String),
    /// Unknown task id
    #[error("{0}")]
    NotFound(String),
    /// Worker pool saturated or shut down; the caller may retry
    #[error("{0}")]
    Transient(String),
    /// Missing configuration or an unexpected runtime fault
    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::BadRequest(_) => "bad_request",
            EngineError::NotFound(_) => "not_found",
            EngineError::Transient(_) => "transient",
            EngineError::Internal(_) => "internal",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            EngineError::BadRequest(m)
            | EngineError::NotFound(m)
            | EngineError::Transient(m)
            | EngineError::Internal(m) => m,
        }
    }
}

/// Failure loading service configuration or an algorithm set
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration found at {}", .0.display())]
    Missing(PathBuf),
    #[error("Unable to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unable to parse {origin}: {message}")]
    Parse { origin: String, message: String },
}
