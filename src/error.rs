//! Error types for churnline.
//!
//! This module provides a unified error type [`ChurnlineError`] for all pipeline,
//! serving and inference operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Schema**: missing, extra or mistyped columns in tables and payloads
//! - **Training**: unknown model families and fitting failures
//! - **Evaluation**: mismatched ground truth and prediction vectors
//! - **Serving**: absent endpoints, endpoints that never became healthy and
//!   running slots held by another process
//! - **Configuration**: invalid settings or unreadable configuration files
//!
//! # Example
//!
//! ```rust
//! use churnline::error::{ChurnlineError, Result};
//!
//! fn require_target(columns: &[&str]) -> Result<()> {
//!     if !columns.contains(&"churn") {
//!         return Err(ChurnlineError::Schema("missing target column 'churn'".into()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_target(&["account_length"]).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for churnline operations.
#[derive(Error, Debug)]
pub enum ChurnlineError {
    // Data errors
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Failed to ingest data from {path}: {reason}")]
    Ingest { path: String, reason: String },

    // Training errors
    #[error("Model {0} not supported")]
    UnsupportedModel(String),

    #[error("Model fit failed: {0}")]
    ModelFit(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    // Serving errors
    #[error("No prediction service deployed for {0}")]
    ServiceNotFound(String),

    #[error("Service {key} did not become healthy within {timeout_ms}ms")]
    ServiceStartTimeout { key: String, timeout_ms: u64 },

    #[error("Service {0} is not running")]
    ServiceNotRunning(String),

    #[error("Service {key} is running in another process ({holder})")]
    ServiceBusy { key: String, holder: String },

    // Configuration errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChurnlineError {
    /// Whether the error stems from caller-supplied data rather than the service side.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ChurnlineError::Schema(_)
                | ChurnlineError::InvalidArgument(_)
                | ChurnlineError::UnsupportedModel(_)
                | ChurnlineError::Evaluation(_)
        )
    }

    /// HTTP status code used by the prediction server.
    pub fn to_status_code(&self) -> u16 {
        match self {
            ChurnlineError::Schema(_) | ChurnlineError::InvalidArgument(_) => 400,
            ChurnlineError::ServiceNotFound(_) => 404,
            ChurnlineError::ServiceBusy { .. } => 409,
            ChurnlineError::ServiceNotRunning(_)
            | ChurnlineError::ServiceStartTimeout { .. } => 503,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for ChurnlineError {
    fn from(e: serde_json::Error) -> Self {
        ChurnlineError::Serialization(e.to_string())
    }
}

impl From<csv::Error> for ChurnlineError {
    fn from(e: csv::Error) -> Self {
        ChurnlineError::Serialization(e.to_string())
    }
}

/// Result type alias for churnline operations.
pub type Result<T> = std::result::Result<T, ChurnlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ChurnlineError::Schema("x".into()).to_status_code(), 400);
        assert_eq!(ChurnlineError::ServiceNotFound("k".into()).to_status_code(), 404);
        let timeout = ChurnlineError::ServiceStartTimeout {
            key: "k".into(),
            timeout_ms: 10,
        };
        assert_eq!(timeout.to_status_code(), 503);
        let busy = ChurnlineError::ServiceBusy {
            key: "k".into(),
            holder: "pid 1".into(),
        };
        assert_eq!(busy.to_status_code(), 409);
        assert_eq!(ChurnlineError::Internal("boom".into()).to_status_code(), 500);
    }

    #[test]
    fn test_client_errors() {
        assert!(ChurnlineError::UnsupportedModel("Svm".into()).is_client_error());
        assert!(!ChurnlineError::ServiceNotFound("k".into()).is_client_error());
    }
}
