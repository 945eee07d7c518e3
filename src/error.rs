//! Error types for the context assembly engine

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ContextError>;

/// Context assembly errors
///
/// Most variants are recovered inside the pipeline and only show up in logs
/// and quality metrics. `InvalidRequest` is the one the caller should expect
/// to see from [`crate::context::ContextEngine::build`].
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Source unavailable: {source_name}: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("All sources failed ({attempted} attempted)")]
    AllSourcesFailed { attempted: usize },

    #[error("Budget infeasible: critical content needs {required} tokens, budget is {budget}")]
    BudgetInfeasible { required: usize, budget: usize },

    #[error("Compression failed ({method}): {reason}")]
    CompressionFailure { method: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Build cancelled")]
    Cancelled,

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContextError {
    /// Whether the engine should answer this error with the fallback context
    pub fn triggers_fallback(&self) -> bool {
        !matches!(self, ContextError::InvalidRequest(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ContextError::SourceUnavailable { .. } => "source_unavailable",
            ContextError::AllSourcesFailed { .. } => "all_sources_failed",
            ContextError::BudgetInfeasible { .. } => "budget_infeasible",
            ContextError::CompressionFailure { .. } => "compression_failure",
            ContextError::InvalidRequest(_) => "invalid_request",
            ContextError::Configuration(_) => "configuration",
            ContextError::Cancelled => "cancelled",
            ContextError::DeadlineExceeded(_) => "deadline_exceeded",
            ContextError::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for ContextError {
    fn from(err: config::ConfigError) -> Self {
        ContextError::Configuration(err.to_string())
    }
}
