//! Error types for Tollgate.
//!
//! Rejected admissions are not errors. Only construction problems and
//! background task failures end up here.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid limiter or file configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background ticker was requested outside of a Tokio runtime
    #[error("No Tokio runtime available to drive background ticks")]
    NoRuntime,

    /// The background task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
