//! Cooperative cancellation.
//!
//! A [`CancellationFlag`] is checked between pipeline stages, never inside a
//! stage's external call: an in-flight call is allowed to finish so the
//! external system is never left mid-operation. Canceling after staging but
//! before activation leaves the workflow staged-but-inactive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{PipelineError, Result};

/// Shared cancellation flag for one job.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    canceled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next stage boundary.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Stage-boundary check: errors with [`PipelineError::Canceled`] if
    /// cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_canceled() {
            Err(PipelineError::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_passes_until_canceled() {
        let flag = CancellationFlag::new();
        assert!(flag.checkpoint().is_ok());

        let shared = flag.clone();
        shared.cancel();

        assert!(flag.is_canceled());
        assert!(matches!(flag.checkpoint(), Err(PipelineError::Canceled)));
    }
}
