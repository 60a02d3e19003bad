//! # flowsmith-pipeline
//!
//! The workflow generation pipeline: from a natural-language design request
//! to a staged (and optionally activated) workflow in the external engine.
//!
//! ```text
//!  DesignService ──▶ JobStore (queued)
//!                        │ claim (guarded UPDATE)
//!                        ▼
//!                   WorkerPool ──▶ GenerationPipeline
//!                        │    retrieval → pattern-analysis → planning
//!                        │    → compilation → validation → staging
//!                        │    → activation
//!                        ▼
//!                   WorkflowStore + AuditLedger + external engine
//! ```
//!
//! Every stage appends a provenance entry before the next stage runs, so a
//! failed job still explains how far it got and why. Cancellation is
//! cooperative and checked at stage boundaries only.
//!
//! ## Quick start
//!
//! ```ignore
//! use flowsmith_pipeline::{DesignRequest, DesignService, WorkerPool};
//!
//! let pool = WorkerPool::new(jobs.clone(), pipeline);
//! pool.start(2);
//!
//! let service = DesignService::new(jobs, retrieval, pool);
//! let job = service
//!     .submit_design_request(DesignRequest {
//!         user_goal: "notify Slack on new webhook order".into(),
//!         auto_stage: true,
//!         auto_activate: false,
//!     })
//!     .await?;
//! ```

pub mod cancel;
pub mod config;
pub mod engine_client;
pub mod error;
pub mod graph;
pub mod llm;
pub mod retry;
pub mod service;
pub mod stages;
pub mod worker;

// ── re-exports ───────────────────────────────────────────────────────

pub use cancel::CancellationFlag;
pub use config::PipelineConfig;
pub use engine_client::{
    EngineClientConfig, ExecutionStatus, HttpWorkflowEngine, WorkflowEngine,
};
pub use error::{PipelineError, Result};
pub use graph::{
    CredentialRef, Edge, Node, Severity, TriggerKind, TriggerSpec, ValidationIssue,
    WorkflowConfig,
};
pub use llm::{
    BestOf, FirstSuccess, HttpLlmBackend, LlmBackend, LlmClientConfig, LlmDraft, MergePolicy,
};
pub use retry::RetryPolicy;
pub use service::DesignService;
pub use stages::{DesignRequest, GenerationPipeline, PipelineOutcome, Stage};
pub use worker::WorkerPool;
