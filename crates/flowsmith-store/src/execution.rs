//! Execution records — run attempts of staged workflows.
//!
//! An execution is created `running` when a test or live run is triggered and
//! becomes terminal once its status leaves `running`/`waiting`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Status of a workflow execution on the external engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
    Waiting,
    Canceled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Waiting => "waiting",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "waiting" => Some(Self::Waiting),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running | Self::Waiting)
    }
}

/// What kind of run this execution is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Test,
    Staging,
    Production,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "staging" => Some(Self::Staging),
            "production" => Some(Self::Production),
            _ => None,
        }
    }
}

/// A persisted run attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub external_execution_id: Option<String>,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub error_message: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub test_payload: Option<serde_json::Value>,
}

/// CRUD for execution records.
#[derive(Clone)]
pub struct ExecutionStore {
    db: Database,
}

impl ExecutionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a newly triggered run in `running` state.
    #[instrument(skip(self, test_payload))]
    pub async fn start(
        &self,
        workflow_id: &str,
        external_execution_id: Option<&str>,
        mode: ExecutionMode,
        test_payload: Option<serde_json::Value>,
    ) -> StoreResult<Execution> {
        let id = Uuid::now_v7().to_string();
        let workflow_id = workflow_id.to_string();
        let external = external_execution_id.map(|s| s.to_string());
        let now = Utc::now().timestamp();
        let test_payload_json = test_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let execution = Execution {
            id: id.clone(),
            workflow_id: workflow_id.clone(),
            external_execution_id: external.clone(),
            status: ExecutionStatus::Running,
            mode,
            started_at: now,
            finished_at: None,
            error_message: None,
            payload: None,
            test_payload,
        };

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO executions (id, workflow_id, external_execution_id, status, mode, \
                     started_at, test_payload) VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?6)",
                    rusqlite::params![id, workflow_id, external, mode.as_str(), now, test_payload_json],
                )?;
                Ok(())
            })
            .await?;

        Ok(execution)
    }

    /// Move an execution to a terminal (or waiting) state.
    ///
    /// Once terminal, further updates are rejected.
    #[instrument(skip(self, payload))]
    pub async fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        error_message: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let error_message = error_message.map(|s| s.to_string());
        let now = Utc::now().timestamp();
        let payload_json = payload.as_ref().map(serde_json::to_string).transpose()?;

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let current: String = tx
                    .query_row(
                        "SELECT status FROM executions WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "execution",
                            id: id.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                let current = ExecutionStatus::parse(&current).ok_or_else(|| {
                    StoreError::InvalidArgument(format!("bad execution status: {current}"))
                })?;
                if current.is_terminal() {
                    return Err(StoreError::InvalidTransition {
                        entity: "execution",
                        id,
                        from: current.as_str().to_string(),
                        to: status.as_str().to_string(),
                    });
                }

                let finished_at = status.is_terminal().then_some(now);
                tx.execute(
                    "UPDATE executions SET status = ?2, finished_at = ?3, error_message = ?4, \
                     payload = ?5 WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), finished_at, error_message, payload_json],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Fetch an execution by id.
    pub async fn get(&self, id: &str) -> StoreResult<Option<Execution>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("{SELECT_EXECUTION} WHERE id = ?1"),
                    rusqlite::params![id],
                    ExecutionRow::from_row,
                );
                match result {
                    Ok(row) => row.into_execution().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// All executions of a workflow, newest first.
    pub async fn list_for_workflow(&self, workflow_id: &str) -> StoreResult<Vec<Execution>> {
        let workflow_id = workflow_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_EXECUTION} WHERE workflow_id = ?1 ORDER BY started_at DESC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![workflow_id], ExecutionRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(|r| r.into_execution()).collect()
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Internal row mapping
// ---------------------------------------------------------------------------

const SELECT_EXECUTION: &str = "SELECT id, workflow_id, external_execution_id, status, mode, \
     started_at, finished_at, error_message, payload, test_payload FROM executions";

struct ExecutionRow {
    id: String,
    workflow_id: String,
    external_execution_id: Option<String>,
    status: String,
    mode: String,
    started_at: i64,
    finished_at: Option<i64>,
    error_message: Option<String>,
    payload: Option<String>,
    test_payload: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            external_execution_id: row.get(2)?,
            status: row.get(3)?,
            mode: row.get(4)?,
            started_at: row.get(5)?,
            finished_at: row.get(6)?,
            error_message: row.get(7)?,
            payload: row.get(8)?,
            test_payload: row.get(9)?,
        })
    }

    fn into_execution(self) -> StoreResult<Execution> {
        Ok(Execution {
            status: ExecutionStatus::parse(&self.status).ok_or_else(|| {
                StoreError::InvalidArgument(format!("bad execution status: {}", self.status))
            })?,
            mode: ExecutionMode::parse(&self.mode).ok_or_else(|| {
                StoreError::InvalidArgument(format!("bad execution mode: {}", self.mode))
            })?,
            payload: self.payload.as_deref().map(serde_json::from_str).transpose()?,
            test_payload: self
                .test_payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            id: self.id,
            workflow_id: self.workflow_id,
            external_execution_id: self.external_execution_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_message: self.error_message,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow_store::WorkflowStore;
    use serde_json::json;

    async fn setup() -> (ExecutionStore, String) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let workflows = WorkflowStore::new(db.clone());
        let wf = workflows.create("wf", "goal").await.unwrap();
        (ExecutionStore::new(db), wf.id)
    }

    #[tokio::test]
    async fn start_and_finish() {
        let (store, wf_id) = setup().await;
        let exec = store
            .start(&wf_id, Some("ext-run-1"), ExecutionMode::Test, Some(json!({"order": 1})))
            .await
            .unwrap();

        assert_eq!(exec.status, ExecutionStatus::Running);

        store
            .finish(&exec.id, ExecutionStatus::Success, None, Some(json!({"ok": true})))
            .await
            .unwrap();

        let fetched = store.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Success);
        assert!(fetched.finished_at.is_some());
        assert_eq!(fetched.payload, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn terminal_execution_is_frozen() {
        let (store, wf_id) = setup().await;
        let exec = store
            .start(&wf_id, None, ExecutionMode::Production, None)
            .await
            .unwrap();

        store
            .finish(&exec.id, ExecutionStatus::Error, Some("boom"), None)
            .await
            .unwrap();

        let result = store.finish(&exec.id, ExecutionStatus::Success, None, None).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn waiting_is_not_terminal() {
        let (store, wf_id) = setup().await;
        let exec = store.start(&wf_id, None, ExecutionMode::Test, None).await.unwrap();

        store.finish(&exec.id, ExecutionStatus::Waiting, None, None).await.unwrap();
        // A waiting execution can still complete.
        store.finish(&exec.id, ExecutionStatus::Success, None, None).await.unwrap();

        let fetched = store.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn list_for_workflow_newest_first() {
        let (store, wf_id) = setup().await;
        store.start(&wf_id, None, ExecutionMode::Test, None).await.unwrap();
        store.start(&wf_id, None, ExecutionMode::Test, None).await.unwrap();

        let all = store.list_for_workflow(&wf_id).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
