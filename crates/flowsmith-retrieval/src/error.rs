//! Retrieval error types.

use thiserror::Error;

/// Errors produced by the retrieval engine.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("storage error: {0}")]
    Store(#[from] flowsmith_store::StoreError),

    #[error("embedding backend error: {reason} (retryable: {retryable})")]
    Backend { reason: String, retryable: bool },

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RetrievalError {
    /// Whether retrying the operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Convenience result alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;
