//! The staged generation pipeline.
//!
//! One job runs the stages strictly in order:
//!
//! ```text
//! retrieval → pattern-analysis → planning → compilation → validation
//!     → staging (auto_stage) → activation (auto_activate)
//! ```
//!
//! Each completed stage appends one provenance entry to the workflow before
//! the next stage starts, so a half-finished run still explains itself. The
//! cancellation flag is checked at every stage boundary; an in-flight
//! external call always finishes first.
//!
//! Security-relevant actions (creation, credential access, staging,
//! activation, blocking validation) append to the audit ledger and the
//! append is awaited before the pipeline proceeds.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use flowsmith_retrieval::{RetrievalEngine, SearchHit};
use flowsmith_store::{
    AuditCategory, AuditLedger, ExecutionMode, ExecutionStore, NewAuditEvent, PatternEntry,
    PatternStore, ProvenanceEntry, Workflow, WorkflowStatus, WorkflowStore,
};
use flowsmith_vault::Vault;

use crate::cancel::CancellationFlag;
use crate::engine_client::WorkflowEngine;
use crate::error::{PipelineError, Result};
use crate::graph::{ValidationIssue, WorkflowConfig};
use crate::llm::{LlmBackend, LlmDraft, MergePolicy};
use crate::retry::RetryPolicy;

const ACTOR: &str = "pipeline";
const RETRIEVAL_TOP_K: usize = 5;
const PATTERN_LIMIT: usize = 5;

// ---------------------------------------------------------------------------
// Request / stage labels
// ---------------------------------------------------------------------------

/// A user's design request, as submitted to the ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignRequest {
    pub user_goal: String,
    #[serde(default)]
    pub auto_stage: bool,
    #[serde(default)]
    pub auto_activate: bool,
}

/// The pipeline's stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Retrieval,
    PatternAnalysis,
    Planning,
    Compilation,
    Validation,
    Staging,
    Activation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieval => "retrieval",
            Self::PatternAnalysis => "pattern-analysis",
            Self::Planning => "planning",
            Self::Compilation => "compilation",
            Self::Validation => "validation",
            Self::Staging => "staging",
            Self::Activation => "activation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished pipeline run hands back to the job queue.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub workflow_id: String,
    pub result: Value,
}

// ---------------------------------------------------------------------------
// GenerationPipeline
// ---------------------------------------------------------------------------

/// Executes the full stage sequence for one job.
pub struct GenerationPipeline {
    retrieval: Arc<RetrievalEngine>,
    patterns: PatternStore,
    workflows: WorkflowStore,
    executions: ExecutionStore,
    audit: AuditLedger,
    vault: Arc<Vault>,
    backends: Vec<Arc<dyn LlmBackend>>,
    merge: Box<dyn MergePolicy>,
    engine: Arc<dyn WorkflowEngine>,
    retry: RetryPolicy,
}

impl GenerationPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        patterns: PatternStore,
        workflows: WorkflowStore,
        executions: ExecutionStore,
        audit: AuditLedger,
        vault: Arc<Vault>,
        backends: Vec<Arc<dyn LlmBackend>>,
        merge: Box<dyn MergePolicy>,
        engine: Arc<dyn WorkflowEngine>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            retrieval,
            patterns,
            workflows,
            executions,
            audit,
            vault,
            backends,
            merge,
            engine,
            retry,
        }
    }

    pub fn workflows(&self) -> &WorkflowStore {
        &self.workflows
    }

    /// Run every stage for `request`. Returns the created workflow's id even
    /// when a later stage fails, so the caller can record it on the job.
    #[instrument(skip(self, request, flag), fields(goal = %request.user_goal))]
    pub async fn run(
        &self,
        request: &DesignRequest,
        flag: &CancellationFlag,
    ) -> std::result::Result<PipelineOutcome, (Option<String>, PipelineError)> {
        flag.checkpoint().map_err(|e| (None, e))?;
        let workflow = self
            .create_workflow(request)
            .await
            .map_err(|e| (None, e))?;
        let workflow_id = workflow.id.clone();

        match self.run_stages(request, &workflow, flag).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err((Some(workflow_id), e)),
        }
    }

    async fn run_stages(
        &self,
        request: &DesignRequest,
        workflow: &Workflow,
        flag: &CancellationFlag,
    ) -> Result<PipelineOutcome> {
        let id = workflow.id.as_str();

        flag.checkpoint()?;
        let hits = self.stage_retrieval(id, &request.user_goal).await?;

        flag.checkpoint()?;
        let patterns = self.stage_pattern_analysis(id).await?;

        flag.checkpoint()?;
        let draft = self
            .stage_planning(id, &request.user_goal, &hits, &patterns)
            .await?;

        flag.checkpoint()?;
        let config = self.stage_compilation(id, &draft).await?;

        flag.checkpoint()?;
        let score = self.stage_validation(id, &config).await?;

        let mut external_id = None;
        if request.auto_stage {
            flag.checkpoint()?;
            external_id = Some(self.stage_staging(id, &config).await?);

            if request.auto_activate {
                flag.checkpoint()?;
                // external_id was just set above.
                if let Some(ext) = external_id.as_deref() {
                    self.stage_activation(id, ext).await?;
                }
            }
        }

        let final_state = self.workflows.get_required(id).await?;
        Ok(PipelineOutcome {
            workflow_id: id.to_string(),
            result: json!({
                "workflow_id": id,
                "status": final_state.status,
                "external_workflow_id": external_id,
                "best_practices_score": score,
            }),
        })
    }

    // ── stages ───────────────────────────────────────────────────────

    async fn create_workflow(&self, request: &DesignRequest) -> Result<Workflow> {
        let name = slugify(&request.user_goal);
        let workflow = self.workflows.create(&name, &request.user_goal).await?;

        self.audit
            .append(
                NewAuditEvent::new("workflow-created", AuditCategory::WorkflowCreation, ACTOR)
                    .workflow(&workflow.id)
                    .details(json!({"name": name})),
            )
            .await?;
        Ok(workflow)
    }

    async fn stage_retrieval(&self, id: &str, goal: &str) -> Result<Vec<SearchHit>> {
        let hits = self.retrieval.search(goal, RETRIEVAL_TOP_K).await?;
        self.append_provenance(
            id,
            Stage::Retrieval,
            format!("retrieved {} knowledge chunk(s)", hits.len()),
            format!("query: {goal}"),
        )
        .await?;
        Ok(hits)
    }

    async fn stage_pattern_analysis(&self, id: &str) -> Result<Vec<PatternEntry>> {
        let all = self.patterns.list_all().await?;
        let (avoid, apply): (Vec<_>, Vec<_>) = all.into_iter().partition(|p| p.anti_pattern);
        let apply: Vec<PatternEntry> = apply.into_iter().take(PATTERN_LIMIT).collect();

        for pattern in &apply {
            self.patterns.record_usage(&pattern.name).await?;
        }

        self.append_provenance(
            id,
            Stage::PatternAnalysis,
            format!(
                "applying {} pattern(s), avoiding {} anti-pattern(s)",
                apply.len(),
                avoid.len().min(PATTERN_LIMIT)
            ),
            apply
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        )
        .await?;
        Ok(apply)
    }

    async fn stage_planning(
        &self,
        id: &str,
        goal: &str,
        hits: &[SearchHit],
        patterns: &[PatternEntry],
    ) -> Result<LlmDraft> {
        let context = build_context(hits, patterns);

        let mut drafts = Vec::new();
        for backend in &self.backends {
            match self
                .retry
                .run("llm-generate", || backend.generate(goal, &context))
                .await
            {
                Ok(draft) => drafts.push(draft),
                Err(e) => warn!(backend = backend.name(), %e, "backend produced no draft"),
            }
        }
        let draft = self.merge.merge(drafts)?;

        self.append_provenance(
            id,
            Stage::Planning,
            format!("selected draft from backend {}", draft.backend),
            format!(
                "{} backend(s), {} context chunk(s), {} pattern(s)",
                self.backends.len(),
                hits.len(),
                patterns.len()
            ),
        )
        .await?;
        Ok(draft)
    }

    /// Parse the draft into the typed graph, verify every referenced
    /// credential resolves, and persist the compiled config. An
    /// unresolvable credential is a blocking failure.
    async fn stage_compilation(&self, id: &str, draft: &LlmDraft) -> Result<WorkflowConfig> {
        let value: Value = serde_json::from_str(&draft.content)?;
        let config = WorkflowConfig::from_value(value)?;

        for cred in config.credential_references() {
            self.vault.verify(&cred.name, cred.scope.as_deref())?;
            // Name and scope only; never the secret.
            self.audit
                .append(
                    NewAuditEvent::new(
                        "credential-verified",
                        AuditCategory::CredentialAccess,
                        ACTOR,
                    )
                    .workflow(id)
                    .details(json!({"name": cred.name, "scope": cred.scope})),
                )
                .await?;
        }

        self.workflows.set_config(id, &serde_json::to_value(&config)?).await?;
        self.append_provenance(
            id,
            Stage::Compilation,
            format!(
                "compiled {} node(s), {} credential reference(s)",
                config.nodes.len(),
                config.credential_references().len()
            ),
            format!("draft from {}", draft.backend),
        )
        .await?;
        Ok(config)
    }

    /// Structural validation. Blocking issues stop the run; the workflow
    /// keeps its last successful status and the recorded findings.
    async fn stage_validation(&self, id: &str, config: &WorkflowConfig) -> Result<f64> {
        let issues = config.validate();
        let score = best_practices_score(&issues);

        let issues_json: Vec<Value> = issues
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?;
        self.workflows.set_validation(id, &issues_json, score).await?;

        let blocking: Vec<ValidationIssue> =
            issues.iter().filter(|i| i.is_blocking()).cloned().collect();
        if !blocking.is_empty() {
            self.audit
                .append(
                    NewAuditEvent::new(
                        "validation-blocked",
                        AuditCategory::ValidationFailure,
                        ACTOR,
                    )
                    .workflow(id)
                    .details(json!({
                        "blocking": blocking.iter().map(|i| i.code.as_str()).collect::<Vec<_>>(),
                    })),
                )
                .await?;
            return Err(PipelineError::Validation { issues: blocking });
        }

        self.workflows.set_status(id, WorkflowStatus::Validated).await?;
        self.append_provenance(
            id,
            Stage::Validation,
            format!("passed with {} advisory finding(s)", issues.len()),
            format!("best practices score {score:.2}"),
        )
        .await?;
        Ok(score)
    }

    /// Push the config to the external engine. The engine id is written
    /// once; a repeat staging of the same workflow updates in place.
    async fn stage_staging(&self, id: &str, config: &WorkflowConfig) -> Result<String> {
        let engine_json = config.to_engine_json();
        let current = self.workflows.get_required(id).await?;

        let external_id = match current.external_workflow_id {
            Some(existing) => {
                self.retry
                    .run("engine-update", || {
                        self.engine.update_workflow(&existing, &engine_json)
                    })
                    .await?;
                existing
            }
            None => {
                let created = self
                    .retry
                    .run("engine-create", || self.engine.create_workflow(&engine_json))
                    .await?;
                self.workflows.set_external_id(id, &created).await?
            }
        };

        self.workflows.set_status(id, WorkflowStatus::Staged).await?;
        self.audit
            .append(
                NewAuditEvent::new("workflow-staged", AuditCategory::Staging, ACTOR)
                    .workflow(id)
                    .details(json!({"external_workflow_id": external_id})),
            )
            .await?;
        self.append_provenance(
            id,
            Stage::Staging,
            "staged to external engine".to_string(),
            format!("external id {external_id}"),
        )
        .await?;

        info!(workflow_id = id, external_id = %external_id, "workflow staged");
        Ok(external_id)
    }

    async fn stage_activation(&self, id: &str, external_id: &str) -> Result<()> {
        self.retry
            .run("engine-activate", || self.engine.activate(external_id))
            .await?;

        self.workflows.set_status(id, WorkflowStatus::Active).await?;
        self.audit
            .append(
                NewAuditEvent::new("workflow-activated", AuditCategory::Activation, ACTOR)
                    .workflow(id)
                    .details(json!({"external_workflow_id": external_id})),
            )
            .await?;
        self.append_provenance(
            id,
            Stage::Activation,
            "activated in external engine".to_string(),
            format!("external id {external_id}"),
        )
        .await?;
        Ok(())
    }

    /// Stage (or re-stage) a workflow that already has a compiled config.
    ///
    /// Re-staging reuses the stored external id and updates the engine-side
    /// workflow in place, so repeating the call never creates a duplicate.
    pub async fn stage_workflow(&self, workflow_id: &str) -> Result<String> {
        let workflow = self.workflows.get_required(workflow_id).await?;
        let config = workflow
            .config
            .ok_or_else(|| PipelineError::InvalidRequest(format!(
                "workflow {workflow_id} has no compiled config"
            )))?;
        let config = WorkflowConfig::from_value(config)?;
        self.stage_staging(workflow_id, &config).await
    }

    /// Activate a staged workflow in the external engine.
    pub async fn activate_workflow(&self, workflow_id: &str) -> Result<()> {
        let workflow = self.workflows.get_required(workflow_id).await?;
        let external_id =
            workflow
                .external_workflow_id
                .ok_or_else(|| PipelineError::InvalidRequest(format!(
                    "workflow {workflow_id} is not staged"
                )))?;
        self.stage_activation(workflow_id, &external_id).await
    }

    /// Deactivate an active workflow in the external engine. The workflow
    /// record is archived, not deleted.
    pub async fn deactivate_workflow(&self, workflow_id: &str) -> Result<()> {
        let workflow = self.workflows.get_required(workflow_id).await?;
        let external_id =
            workflow
                .external_workflow_id
                .ok_or_else(|| PipelineError::InvalidRequest(format!(
                    "workflow {workflow_id} is not staged"
                )))?;
        self.retry
            .run("engine-deactivate", || self.engine.deactivate(&external_id))
            .await?;
        self.workflows.set_status(workflow_id, WorkflowStatus::Archived).await?;
        self.audit
            .append(
                NewAuditEvent::new("workflow-deactivated", AuditCategory::Activation, ACTOR)
                    .workflow(workflow_id)
                    .details(json!({"external_workflow_id": external_id})),
            )
            .await?;
        Ok(())
    }

    /// Run one dry-run execution against the staged workflow and record the
    /// result on the workflow row.
    pub async fn test_workflow(&self, workflow_id: &str, input: &Value) -> Result<Value> {
        let workflow = self.workflows.get_required(workflow_id).await?;
        let external_id =
            workflow
                .external_workflow_id
                .ok_or_else(|| PipelineError::InvalidRequest(format!(
                    "workflow {workflow_id} is not staged"
                )))?;

        let handle = self
            .retry
            .run("engine-test", || self.engine.trigger_test(&external_id, input))
            .await?;
        let execution = self
            .executions
            .start(workflow_id, Some(&handle), ExecutionMode::Test, Some(input.clone()))
            .await?;

        let status = self.engine.execution_status(&handle).await?;
        let stored = flowsmith_store::ExecutionStatus::parse(&status.state)
            .unwrap_or(flowsmith_store::ExecutionStatus::Running);
        if stored.is_terminal() {
            self.executions
                .finish(&execution.id, stored, None, status.output.clone())
                .await?;
        }

        let results = serde_json::to_value(&status)?;
        self.workflows.set_test_results(workflow_id, &results).await?;
        Ok(results)
    }

    /// Run history for a workflow, newest first.
    pub async fn execution_history(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<flowsmith_store::Execution>> {
        Ok(self.executions.list_for_workflow(workflow_id).await?)
    }

    async fn append_provenance(
        &self,
        id: &str,
        stage: Stage,
        decision: String,
        inputs_summary: String,
    ) -> Result<()> {
        self.workflows
            .append_provenance(
                id,
                ProvenanceEntry {
                    stage: stage.as_str().to_string(),
                    decision,
                    inputs_summary,
                    timestamp: Utc::now().timestamp(),
                },
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn slugify(goal: &str) -> String {
    let mut slug = String::new();
    for c in goal.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 48 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "workflow".to_string()
    } else {
        slug.to_string()
    }
}

fn build_context(hits: &[SearchHit], patterns: &[PatternEntry]) -> String {
    let mut out = String::new();
    for hit in hits {
        out.push_str(&format!(
            "[{}] {}\n{}\n\n",
            hit.document.source, hit.document.title, hit.chunk_text
        ));
    }
    if !patterns.is_empty() {
        out.push_str("Apply these practices:\n");
        for pattern in patterns {
            out.push_str(&format!("- {}: {}\n", pattern.name, pattern.description));
        }
    }
    out
}

/// 1.0 minus a tenth per advisory finding, floored at zero. Blocking
/// findings never reach scoring.
fn best_practices_score(issues: &[ValidationIssue]) -> f64 {
    let advisories = issues.iter().filter(|i| !i.is_blocking()).count();
    (1.0 - 0.1 * advisories as f64).max(0.0)
}

// ── tests ────────────────────────────────────────────────────────────
