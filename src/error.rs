//! Error types for the task execution spine

use thiserror::Error;

/// Result type for spine operations
pub type SpineResult<T> = Result<T, SpineError>;

/// Error types surfaced at the core boundary
#[derive(Error, Debug)]
pub enum SpineError {
    /// Task lookup failed
    #[error("Task {0} not found")]
    TaskNotFound(String),

    /// Management or protocol transition rejected
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Strict-finalize tripwire fired at the commit boundary
    #[error("Task finalization invariant violated: {0}")]
    FinalizeInvariant(String),

    /// Sterling ingest could not produce executable steps
    #[error("Sterling ingest blocked: {0}")]
    IngestBlocked(String),

    /// Step lookup failed
    #[error("Step {step_id} not found on task {task_id}")]
    StepNotFound { task_id: String, step_id: String },

    /// Remote action endpoint failure
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SpineError {
    fn from(err: serde_json::Error) -> Self {
        SpineError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SpineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SpineError::Timeout
        } else {
            SpineError::Gateway(err.to_string())
        }
    }
}
