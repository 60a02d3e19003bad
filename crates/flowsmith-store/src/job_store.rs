//! Generation job queue — the asynchronous unit of work.
//!
//! Jobs move `queued` → `running` → `succeeded` | `failed` and never re-enter
//! `queued`. The claim operation is a single guarded UPDATE (`WHERE status =
//! 'queued'`), which is the compare-and-swap that guarantees at most one
//! worker ever transitions a given job to `running` — SQLite serializes the
//! write, and the second claimant's UPDATE matches zero rows.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle status of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    pub status: JobStatus,
    /// The original design request, as submitted.
    pub request: serde_json::Value,
    /// Identity of the worker that claimed this job.
    pub worker: Option<String>,
    /// Set on success.
    pub workflow_id: Option<String>,
    pub failure_reason: Option<String>,
    /// Result snapshot for presentation layers.
    pub result: Option<serde_json::Value>,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Queue operations for generation jobs.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a job in `queued` state and return it.
    #[instrument(skip(self, request))]
    pub async fn enqueue(&self, request: serde_json::Value) -> StoreResult<GenerationJob> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().timestamp();
        let request_json = serde_json::to_string(&request)?;

        let id2 = id.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO generation_jobs (id, status, request, submitted_at) \
                     VALUES (?1, 'queued', ?2, ?3)",
                    rusqlite::params![id2, request_json, now],
                )?;
                Ok(())
            })
            .await?;

        info!(job_id = %id, "generation job queued");
        Ok(GenerationJob {
            id,
            status: JobStatus::Queued,
            request,
            worker: None,
            workflow_id: None,
            failure_reason: None,
            result: None,
            submitted_at: now,
            started_at: None,
            finished_at: None,
        })
    }

    /// Atomically claim a specific queued job for `worker`.
    ///
    /// Returns `true` if this call performed the `queued` → `running`
    /// transition, `false` if someone else already did.
    #[instrument(skip(self))]
    pub async fn claim(&self, job_id: &str, worker: &str) -> StoreResult<bool> {
        let job_id = job_id.to_string();
        let worker = worker.to_string();
        let now = Utc::now().timestamp();
        let claimed = self
            .db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE generation_jobs SET status = 'running', worker = ?2, started_at = ?3 \
                     WHERE id = ?1 AND status = 'queued'",
                    rusqlite::params![job_id, worker, now],
                )?;
                Ok(updated == 1)
            })
            .await?;
        Ok(claimed)
    }

    /// Claim the oldest queued job, if any.
    ///
    /// The subselect and UPDATE run in one immediate transaction, so two
    /// workers polling concurrently never claim the same job.
    pub async fn claim_next(&self, worker: &str) -> StoreResult<Option<GenerationJob>> {
        let worker = worker.to_string();
        let now = Utc::now().timestamp();
        let claimed_id = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(
                    rusqlite::TransactionBehavior::Immediate,
                )?;
                let candidate: Option<String> = tx
                    .query_row(
                        "SELECT id FROM generation_jobs WHERE status = 'queued' \
                         ORDER BY submitted_at ASC, id ASC LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(StoreError::Sqlite(other)),
                    })?;

                let Some(id) = candidate else {
                    return Ok(None);
                };

                let updated = tx.execute(
                    "UPDATE generation_jobs SET status = 'running', worker = ?2, started_at = ?3 \
                     WHERE id = ?1 AND status = 'queued'",
                    rusqlite::params![id, worker, now],
                )?;
                tx.commit()?;
                Ok((updated == 1).then_some(id))
            })
            .await?;

        match claimed_id {
            Some(id) => {
                debug!(job_id = %id, "job claimed");
                self.get(&id).await
            }
            None => Ok(None),
        }
    }

    /// Mark a running job as succeeded.
    #[instrument(skip(self, result))]
    pub async fn complete(
        &self,
        job_id: &str,
        workflow_id: &str,
        result: serde_json::Value,
    ) -> StoreResult<()> {
        let job_id = job_id.to_string();
        let workflow_id = workflow_id.to_string();
        let result_json = serde_json::to_string(&result)?;
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE generation_jobs SET status = 'succeeded', workflow_id = ?2, \
                     result = ?3, finished_at = ?4 WHERE id = ?1 AND status = 'running'",
                    rusqlite::params![job_id, workflow_id, result_json, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::InvalidTransition {
                        entity: "generation job",
                        id: job_id,
                        from: "non-running".into(),
                        to: "succeeded".into(),
                    });
                }
                Ok(())
            })
            .await
    }

    /// Mark a running job as failed with a structured reason.
    ///
    /// The workflow id is still recorded when one was created, so the
    /// preserved workflow can be inspected and retried.
    #[instrument(skip(self))]
    pub async fn fail(
        &self,
        job_id: &str,
        workflow_id: Option<&str>,
        reason: &str,
    ) -> StoreResult<()> {
        let job_id = job_id.to_string();
        let workflow_id = workflow_id.map(|s| s.to_string());
        let reason = reason.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE generation_jobs SET status = 'failed', workflow_id = ?2, \
                     failure_reason = ?3, finished_at = ?4 WHERE id = ?1 AND status = 'running'",
                    rusqlite::params![job_id, workflow_id, reason, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::InvalidTransition {
                        entity: "generation job",
                        id: job_id,
                        from: "non-running".into(),
                        to: "failed".into(),
                    });
                }
                Ok(())
            })
            .await
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: &str) -> StoreResult<Option<GenerationJob>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("{SELECT_JOB} WHERE id = ?1"),
                    rusqlite::params![id],
                    JobRow::from_row,
                );
                match result {
                    Ok(row) => row.into_job().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Number of jobs currently queued.
    pub async fn queued_count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                let c: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM generation_jobs WHERE status = 'queued'",
                    [],
                    |row| row.get(0),
                )?;
                Ok(c)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Internal row mapping
// ---------------------------------------------------------------------------

const SELECT_JOB: &str = "SELECT id, status, request, worker, workflow_id, failure_reason, \
     result, submitted_at, started_at, finished_at FROM generation_jobs";

struct JobRow {
    id: String,
    status: String,
    request: String,
    worker: Option<String>,
    workflow_id: Option<String>,
    failure_reason: Option<String>,
    result: Option<String>,
    submitted_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            request: row.get(2)?,
            worker: row.get(3)?,
            workflow_id: row.get(4)?,
            failure_reason: row.get(5)?,
            result: row.get(6)?,
            submitted_at: row.get(7)?,
            started_at: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }

    fn into_job(self) -> StoreResult<GenerationJob> {
        Ok(GenerationJob {
            status: JobStatus::parse(&self.status).ok_or_else(|| {
                StoreError::InvalidArgument(format!("bad job status: {}", self.status))
            })?,
            request: serde_json::from_str(&self.request)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            id: self.id,
            worker: self.worker,
            workflow_id: self.workflow_id,
            failure_reason: self.failure_reason,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> JobStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        JobStore::new(db)
    }

    #[tokio::test]
    async fn enqueue_and_get() {
        let store = setup().await;
        let job = store.enqueue(json!({"user_goal": "notify"})).await.unwrap();

        assert_eq!(job.status, JobStatus::Queued);

        let fetched = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.request, json!({"user_goal": "notify"}));
        assert!(fetched.worker.is_none());
    }

    #[tokio::test]
    async fn claim_transitions_exactly_once() {
        let store = setup().await;
        let job = store.enqueue(json!({})).await.unwrap();

        assert!(store.claim(&job.id, "worker-0").await.unwrap());
        assert!(!store.claim(&job.id, "worker-1").await.unwrap());

        let fetched = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Running);
        assert_eq!(fetched.worker.as_deref(), Some("worker-0"));
    }

    #[tokio::test]
    async fn concurrent_claims_yield_one_winner() {
        let store = setup().await;
        let job = store.enqueue(json!({})).await.unwrap();

        let mut handles = Vec::new();
        for k in 0..8 {
            let store = store.clone();
            let id = job.id.clone();
            handles.push(tokio::spawn(async move {
                store.claim(&id, &format!("worker-{k}")).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn claim_next_takes_oldest() {
        let store = setup().await;
        let first = store.enqueue(json!({"n": 1})).await.unwrap();
        let _second = store.enqueue(json!({"n": 2})).await.unwrap();

        let claimed = store.claim_next("w").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn claim_next_on_empty_queue() {
        let store = setup().await;
        assert!(store.claim_next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_requires_running() {
        let store = setup().await;
        let job = store.enqueue(json!({})).await.unwrap();

        // Not yet claimed.
        let result = store.complete(&job.id, "wf-1", json!({})).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));

        store.claim(&job.id, "w").await.unwrap();
        store.complete(&job.id, "wf-1", json!({"ok": true})).await.unwrap();

        let fetched = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Succeeded);
        assert_eq!(fetched.workflow_id.as_deref(), Some("wf-1"));
        assert!(fetched.finished_at.is_some());
    }

    #[tokio::test]
    async fn fail_preserves_workflow_reference() {
        let store = setup().await;
        let job = store.enqueue(json!({})).await.unwrap();
        store.claim(&job.id, "w").await.unwrap();
        store
            .fail(&job.id, Some("wf-1"), "credential not found: slack-token")
            .await
            .unwrap();

        let fetched = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Failed);
        assert_eq!(fetched.workflow_id.as_deref(), Some("wf-1"));
        assert!(fetched.failure_reason.unwrap().contains("credential"));
    }

    #[tokio::test]
    async fn terminal_job_never_requeues() {
        let store = setup().await;
        let job = store.enqueue(json!({})).await.unwrap();
        store.claim(&job.id, "w").await.unwrap();
        store.fail(&job.id, None, "boom").await.unwrap();

        // A failed job cannot be claimed again.
        assert!(!store.claim(&job.id, "w2").await.unwrap());
        assert_eq!(store.queued_count().await.unwrap(), 0);
    }
}
