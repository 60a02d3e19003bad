//! # flowsmith-scheduler
//!
//! Fault-isolated interval scheduler for Flowsmith maintenance jobs.
//!
//! Every registered job gets its own tokio interval loop: one job failing or
//! overrunning never affects another job's cadence. Overlapping runs of the
//! same job are skipped rather than queued, and each executed run writes
//! exactly one result row through the store.
//!
//! ## Quick start
//!
//! ```ignore
//! use flowsmith_scheduler::{Scheduler, jobs};
//!
//! let scheduler = Scheduler::new(scheduler_store);
//! scheduler
//!     .register("embed-pending", Duration::from_secs(60), jobs::embed_pending_job(engine, 16))
//!     .await?;
//! ```

pub mod error;
pub mod jobs;
pub mod scheduler;

// ── re-exports ───────────────────────────────────────────────────────

pub use error::{Result, SchedulerError};
pub use scheduler::{JobHandler, Scheduler};
