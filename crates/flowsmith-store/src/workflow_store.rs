//! Workflow persistence — the generated artifact and its provenance trail.
//!
//! A workflow's status only advances forward (`created` → `validated` →
//! `staged` → `active`) except for the two escape hatches `failed` and
//! `archived`. The store enforces those transitions so no caller can roll a
//! live workflow back to a draft state. `external_workflow_id` is written
//! once; idempotent re-staging reuses the stored id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle status of a generated workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Created,
    Validated,
    Staged,
    Active,
    Failed,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validated => "validated",
            Self::Staged => "staged",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "validated" => Some(Self::Validated),
            "staged" => Some(Self::Staged),
            "active" => Some(Self::Active),
            "failed" => Some(Self::Failed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Forward-only along the happy path; `failed` and `archived` are
    /// reachable from anywhere (and re-staging a staged workflow is a no-op
    /// handled by the caller, not a transition).
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        if matches!(next, Failed | Archived) {
            return true;
        }
        matches!(
            (self, next),
            (Created, Validated) | (Validated, Staged) | (Staged, Active)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline stage's decision, attached to the workflow for traceability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvenanceEntry {
    /// Stage label (e.g. "retrieval", "compilation").
    pub stage: String,
    /// What the stage decided, in one line.
    pub decision: String,
    /// Short summary of the stage's inputs. Never contains secret material.
    pub inputs_summary: String,
    pub timestamp: i64,
}

/// A persisted generated workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub user_goal: String,
    pub config: Option<serde_json::Value>,
    pub external_workflow_id: Option<String>,
    pub status: WorkflowStatus,
    pub validation_errors: Vec<serde_json::Value>,
    pub best_practices_score: Option<f64>,
    pub test_results: Option<serde_json::Value>,
    pub provenance: Vec<ProvenanceEntry>,
    pub created_at: i64,
    pub updated_at: i64,
    pub staged_at: Option<i64>,
    pub activated_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

/// CRUD and state-machine operations on workflows.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a workflow in `created` state.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, user_goal: &str) -> StoreResult<Workflow> {
        let id = Uuid::now_v7().to_string();
        let name = name.to_string();
        let user_goal = user_goal.to_string();
        let now = Utc::now().timestamp();

        let id2 = id.clone();
        let name2 = name.clone();
        let goal2 = user_goal.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, name, user_goal, status, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, 'created', ?4, ?4)",
                    rusqlite::params![id2, name2, goal2, now],
                )?;
                Ok(())
            })
            .await?;

        info!(workflow_id = %id, "workflow created");
        Ok(Workflow {
            id,
            name,
            user_goal,
            config: None,
            external_workflow_id: None,
            status: WorkflowStatus::Created,
            validation_errors: Vec::new(),
            best_practices_score: None,
            test_results: None,
            provenance: Vec::new(),
            created_at: now,
            updated_at: now,
            staged_at: None,
            activated_at: None,
        })
    }

    /// Fetch a workflow by id.
    pub async fn get(&self, id: &str) -> StoreResult<Option<Workflow>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("{SELECT_WORKFLOW} WHERE id = ?1"),
                    rusqlite::params![id],
                    WorkflowRow::from_row,
                );
                match result {
                    Ok(row) => row.into_workflow().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Required-variant of [`get`].
    pub async fn get_required(&self, id: &str) -> StoreResult<Workflow> {
        self.get(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "workflow",
            id: id.to_string(),
        })
    }

    /// Replace the compiled config.
    pub async fn set_config(&self, id: &str, config: &serde_json::Value) -> StoreResult<()> {
        let id = id.to_string();
        let config_json = serde_json::to_string(config)?;
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE workflows SET config = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, config_json, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "workflow",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Store validation output (issues plus score).
    pub async fn set_validation(
        &self,
        id: &str,
        errors: &[serde_json::Value],
        best_practices_score: f64,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let errors_json = serde_json::to_string(errors)?;
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE workflows SET validation_errors = ?2, best_practices_score = ?3, \
                     updated_at = ?4 WHERE id = ?1",
                    rusqlite::params![id, errors_json, best_practices_score, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "workflow",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Store dry-run test results.
    pub async fn set_test_results(&self, id: &str, results: &serde_json::Value) -> StoreResult<()> {
        let id = id.to_string();
        let results_json = serde_json::to_string(results)?;
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE workflows SET test_results = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, results_json, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "workflow",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Advance the workflow status, enforcing forward-only transitions.
    #[instrument(skip(self))]
    pub async fn set_status(&self, id: &str, next: WorkflowStatus) -> StoreResult<()> {
        let id = id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let current: String = tx
                    .query_row(
                        "SELECT status FROM workflows WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "workflow",
                            id: id.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                let current = WorkflowStatus::parse(&current).ok_or_else(|| {
                    StoreError::InvalidArgument(format!("bad workflow status: {current}"))
                })?;

                if current == next {
                    // Idempotent no-op (re-stage of a staged workflow, etc.).
                    return Ok(());
                }
                if !current.can_transition_to(next) {
                    return Err(StoreError::InvalidTransition {
                        entity: "workflow",
                        id,
                        from: current.as_str().to_string(),
                        to: next.as_str().to_string(),
                    });
                }

                let stamp_column = match next {
                    WorkflowStatus::Staged => ", staged_at = ?3",
                    WorkflowStatus::Active => ", activated_at = ?3",
                    _ => "",
                };
                tx.execute(
                    &format!(
                        "UPDATE workflows SET status = ?2, updated_at = ?3{stamp_column} WHERE id = ?1"
                    ),
                    rusqlite::params![id, next.as_str(), now],
                )?;
                tx.commit()?;
                debug!(from = %current, to = %next, "workflow status advanced");
                Ok(())
            })
            .await
    }

    /// Record the external engine's id for this workflow.
    ///
    /// Written exactly once; a second call with any id returns the already
    /// stored value so re-staging stays idempotent.
    #[instrument(skip(self))]
    pub async fn set_external_id(&self, id: &str, external_id: &str) -> StoreResult<String> {
        let id = id.to_string();
        let external_id = external_id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT external_workflow_id FROM workflows WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "workflow",
                            id: id.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;

                if let Some(existing) = existing {
                    return Ok(existing);
                }

                tx.execute(
                    "UPDATE workflows SET external_workflow_id = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, external_id, now],
                )?;
                tx.commit()?;
                Ok(external_id)
            })
            .await
    }

    /// Append one provenance entry, preserving order.
    pub async fn append_provenance(&self, id: &str, entry: ProvenanceEntry) -> StoreResult<()> {
        let id = id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let raw: String = tx
                    .query_row(
                        "SELECT provenance FROM workflows WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "workflow",
                            id: id.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                let mut entries: Vec<ProvenanceEntry> = serde_json::from_str(&raw)?;
                entries.push(entry);
                tx.execute(
                    "UPDATE workflows SET provenance = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, serde_json::to_string(&entries)?, now],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// List workflows by status, newest first.
    pub async fn list_by_status(&self, status: WorkflowStatus) -> StoreResult<Vec<Workflow>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_WORKFLOW} WHERE status = ?1 ORDER BY created_at DESC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status.as_str()], WorkflowRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(|r| r.into_workflow()).collect()
            })
            .await
    }

}

// ---------------------------------------------------------------------------
// Internal row mapping
// ---------------------------------------------------------------------------

const SELECT_WORKFLOW: &str = "SELECT id, name, user_goal, config, external_workflow_id, status, \
     validation_errors, best_practices_score, test_results, provenance, created_at, updated_at, \
     staged_at, activated_at FROM workflows";

struct WorkflowRow {
    id: String,
    name: String,
    user_goal: String,
    config: Option<String>,
    external_workflow_id: Option<String>,
    status: String,
    validation_errors: String,
    best_practices_score: Option<f64>,
    test_results: Option<String>,
    provenance: String,
    created_at: i64,
    updated_at: i64,
    staged_at: Option<i64>,
    activated_at: Option<i64>,
}

impl WorkflowRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            user_goal: row.get(2)?,
            config: row.get(3)?,
            external_workflow_id: row.get(4)?,
            status: row.get(5)?,
            validation_errors: row.get(6)?,
            best_practices_score: row.get(7)?,
            test_results: row.get(8)?,
            provenance: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            staged_at: row.get(12)?,
            activated_at: row.get(13)?,
        })
    }

    fn into_workflow(self) -> StoreResult<Workflow> {
        Ok(Workflow {
            status: WorkflowStatus::parse(&self.status).ok_or_else(|| {
                StoreError::InvalidArgument(format!("bad workflow status: {}", self.status))
            })?,
            config: self.config.as_deref().map(serde_json::from_str).transpose()?,
            validation_errors: serde_json::from_str(&self.validation_errors)?,
            test_results: self
                .test_results
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            provenance: serde_json::from_str(&self.provenance)?,
            id: self.id,
            name: self.name,
            user_goal: self.user_goal,
            external_workflow_id: self.external_workflow_id,
            best_practices_score: self.best_practices_score,
            created_at: self.created_at,
            updated_at: self.updated_at,
            staged_at: self.staged_at,
            activated_at: self.activated_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> WorkflowStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        WorkflowStore::new(db)
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = setup().await;
        let wf = store.create("slack-notifier", "notify Slack on order").await.unwrap();

        assert_eq!(wf.status, WorkflowStatus::Created);
        assert!(wf.external_workflow_id.is_none());

        let fetched = store.get_required(&wf.id).await.unwrap();
        assert_eq!(fetched.name, "slack-notifier");
        assert!(fetched.provenance.is_empty());
    }

    #[tokio::test]
    async fn status_advances_forward_only() {
        let store = setup().await;
        let wf = store.create("wf", "goal").await.unwrap();

        store.set_status(&wf.id, WorkflowStatus::Validated).await.unwrap();
        store.set_status(&wf.id, WorkflowStatus::Staged).await.unwrap();
        store.set_status(&wf.id, WorkflowStatus::Active).await.unwrap();

        // No way back.
        let result = store.set_status(&wf.id, WorkflowStatus::Created).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn skipping_a_stage_is_rejected() {
        let store = setup().await;
        let wf = store.create("wf", "goal").await.unwrap();

        let result = store.set_status(&wf.id, WorkflowStatus::Staged).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn failed_and_archived_reachable_from_anywhere() {
        let store = setup().await;
        let wf = store.create("wf", "goal").await.unwrap();
        store.set_status(&wf.id, WorkflowStatus::Failed).await.unwrap();

        let wf2 = store.create("wf2", "goal").await.unwrap();
        store.set_status(&wf2.id, WorkflowStatus::Validated).await.unwrap();
        store.set_status(&wf2.id, WorkflowStatus::Archived).await.unwrap();
    }

    #[tokio::test]
    async fn same_status_is_noop() {
        let store = setup().await;
        let wf = store.create("wf", "goal").await.unwrap();
        store.set_status(&wf.id, WorkflowStatus::Validated).await.unwrap();
        // Setting the current status again succeeds without complaint.
        store.set_status(&wf.id, WorkflowStatus::Validated).await.unwrap();
    }

    #[tokio::test]
    async fn external_id_written_once() {
        let store = setup().await;
        let wf = store.create("wf", "goal").await.unwrap();

        let first = store.set_external_id(&wf.id, "ext-123").await.unwrap();
        assert_eq!(first, "ext-123");

        // Second write returns the original id, regardless of input.
        let second = store.set_external_id(&wf.id, "ext-456").await.unwrap();
        assert_eq!(second, "ext-123");

        let fetched = store.get_required(&wf.id).await.unwrap();
        assert_eq!(fetched.external_workflow_id.as_deref(), Some("ext-123"));
    }

    #[tokio::test]
    async fn provenance_preserves_order() {
        let store = setup().await;
        let wf = store.create("wf", "goal").await.unwrap();

        for (i, stage) in ["retrieval", "pattern-analysis", "planning"].iter().enumerate() {
            store
                .append_provenance(
                    &wf.id,
                    ProvenanceEntry {
                        stage: stage.to_string(),
                        decision: format!("decision {i}"),
                        inputs_summary: "inputs".into(),
                        timestamp: i as i64,
                    },
                )
                .await
                .unwrap();
        }

        let fetched = store.get_required(&wf.id).await.unwrap();
        assert_eq!(fetched.provenance.len(), 3);
        assert_eq!(fetched.provenance[0].stage, "retrieval");
        assert_eq!(fetched.provenance[2].stage, "planning");
    }

    #[tokio::test]
    async fn config_validation_and_test_results_roundtrip() {
        let store = setup().await;
        let wf = store.create("wf", "goal").await.unwrap();

        store.set_config(&wf.id, &json!({"nodes": []})).await.unwrap();
        store
            .set_validation(&wf.id, &[json!({"severity": "advisory", "code": "NO_ERROR_PATH"})], 0.7)
            .await
            .unwrap();
        store.set_test_results(&wf.id, &json!({"dry_run": "ok"})).await.unwrap();

        let fetched = store.get_required(&wf.id).await.unwrap();
        assert_eq!(fetched.config, Some(json!({"nodes": []})));
        assert_eq!(fetched.validation_errors.len(), 1);
        assert_eq!(fetched.best_practices_score, Some(0.7));
        assert_eq!(fetched.test_results, Some(json!({"dry_run": "ok"})));
    }

    #[tokio::test]
    async fn staged_timestamp_recorded() {
        let store = setup().await;
        let wf = store.create("wf", "goal").await.unwrap();
        store.set_status(&wf.id, WorkflowStatus::Validated).await.unwrap();
        store.set_status(&wf.id, WorkflowStatus::Staged).await.unwrap();

        let fetched = store.get_required(&wf.id).await.unwrap();
        assert!(fetched.staged_at.is_some());
        assert!(fetched.activated_at.is_none());
    }

    #[tokio::test]
    async fn missing_workflow_errors() {
        let store = setup().await;
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(matches!(
            store.get_required("nope").await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
