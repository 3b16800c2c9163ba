//! Error taxonomy for fetching, planning and configuration

use thiserror::Error;

/// Errors raised by collaborators and the planner
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Credentials missing or rejected; aborts the whole run
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider rate limit hit; retryable with backoff
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// No usable data for a single resource
    #[error("data unavailable for {resource_id}: {reason}")]
    DataUnavailable { resource_id: String, reason: String },

    /// Caller configuration defect, never retried
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Any other provider CLI/API failure
    #[error("provider call failed: {0}")]
    Provider(String),

    #[error("failed to parse provider response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl OptimizerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OptimizerError::Quota(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, OptimizerError::Auth(_) | OptimizerError::Config(_))
    }
}

impl From<reqwest::Error> for OptimizerError {
    fn from(err: reqwest::Error) -> Self {
        OptimizerError::Provider(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OptimizerError>;
