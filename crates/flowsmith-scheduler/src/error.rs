//! Scheduler error types.

use thiserror::Error;

/// Errors produced by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Store(#[from] flowsmith_store::StoreError),

    #[error("job already running: {name}")]
    AlreadyRunning { name: String },

    #[error("job is disabled: {name}")]
    Disabled { name: String },

    #[error("unknown job: {name}")]
    UnknownJob { name: String },

    #[error("scheduler is shut down")]
    Shutdown,
}

/// Convenience result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
