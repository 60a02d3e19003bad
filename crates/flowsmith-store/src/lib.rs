//! # flowsmith-store
//!
//! Storage engine for Flowsmith.
//!
//! Provides SQLite-backed persistence with WAL mode: the knowledge base
//! (documents, chunk embeddings, pattern library), the workflow generation
//! pipeline state (workflows, executions, generation jobs), the append-only
//! audit ledger, and scheduler bookkeeping.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  KnowledgeStore   (documents + embeddings)   │
//! │  PatternStore     (pattern library)          │
//! │  WorkflowStore    (lifecycle + provenance)   │
//! │  ExecutionStore   (run attempts)             │
//! │  JobStore         (generation job queue)     │
//! │  AuditLedger      (append-only events)       │
//! │  SchedulerStore   (recurring job results)    │
//! ├──────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking)     │
//! │  Migrations (versioned, transactional)       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use flowsmith_store::{Database, KnowledgeStore, WorkflowStore};
//!
//! let db = Database::open_and_migrate("data/flowsmith.db").await?;
//! let knowledge = KnowledgeStore::new(db.clone());
//! let workflows = WorkflowStore::new(db);
//! ```

pub mod audit;
pub mod db;
pub mod error;
pub mod execution;
pub mod job_store;
pub mod knowledge;
pub mod migration;
pub mod patterns;
pub mod scheduler_store;
pub mod workflow_store;

// ── re-exports ───────────────────────────────────────────────────────

pub use audit::{AuditCategory, AuditEvent, AuditLedger, NewAuditEvent};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use execution::{Execution, ExecutionMode, ExecutionStatus, ExecutionStore};
pub use job_store::{GenerationJob, JobStatus, JobStore};
pub use knowledge::{
    Document, DocumentSource, EmbedState, IngestOutcome, KnowledgeStore, NewDocument, StoredChunk,
};
pub use patterns::{NewPattern, PatternCategory, PatternEntry, PatternStore};
pub use scheduler_store::{SchedulerJob, SchedulerResult, SchedulerStore};
pub use workflow_store::{ProvenanceEntry, Workflow, WorkflowStatus, WorkflowStore};
