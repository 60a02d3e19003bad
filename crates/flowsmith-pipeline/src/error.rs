//! Pipeline error types.
//!
//! The taxonomy mirrors how failures propagate: blocking validation issues
//! and credential failures stop a job; transient external errors are retried
//! by the bounded retry policy; everything lands in the job's structured
//! `failure_reason`, never in a silent discard.

use thiserror::Error;

use crate::graph::ValidationIssue;

/// Errors produced by the generation pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Store(#[from] flowsmith_store::StoreError),

    #[error("retrieval error: {0}")]
    Retrieval(#[from] flowsmith_retrieval::RetrievalError),

    #[error("credential error: {0}")]
    Credential(#[from] flowsmith_vault::VaultError),

    #[error("validation failed with {} blocking issue(s)", issues.len())]
    Validation { issues: Vec<ValidationIssue> },

    #[error("external service error: {reason} (retryable: {retryable})")]
    External { reason: String, retryable: bool },

    #[error("job canceled")]
    Canceled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    /// Whether the bounded retry policy should try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::External { retryable, .. } => *retryable,
            Self::Retrieval(e) => e.is_retryable(),
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Structured failure reason recorded on the job.
    pub fn failure_reason(&self) -> String {
        match self {
            Self::Credential(e) => format!("credential: {e}"),
            Self::Validation { issues } => {
                let summary: Vec<&str> = issues
                    .iter()
                    .filter(|i| i.is_blocking())
                    .map(|i| i.message.as_str())
                    .collect();
                format!("validation: {}", summary.join("; "))
            }
            Self::External { reason, .. } => format!("external: {reason}"),
            Self::Canceled => "canceled".to_string(),
            other => other.to_string(),
        }
    }
}

/// Convenience result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
