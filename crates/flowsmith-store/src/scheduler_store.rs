//! Bookkeeping for recurring background jobs.
//!
//! The scheduler crate owns the run loops; this store persists job
//! definitions and one result row per completed run so that missed or
//! failing jobs are visible after the fact.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// A registered recurring job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerJob {
    pub id: String,
    pub name: String,
    pub interval_seconds: u64,
    pub enabled: bool,
    pub created_at: i64,
}

/// Outcome of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerResult {
    pub id: i64,
    pub job_id: String,
    pub executed_at: i64,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Persistence for scheduler job definitions and run results.
#[derive(Clone)]
pub struct SchedulerStore {
    db: Database,
}

impl SchedulerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a job by name, updating the interval if it already exists.
    #[instrument(skip(self))]
    pub async fn upsert_job(&self, name: &str, interval_seconds: u64) -> StoreResult<SchedulerJob> {
        if interval_seconds == 0 {
            return Err(StoreError::InvalidArgument(
                "scheduler interval must be positive".into(),
            ));
        }
        let name = name.to_string();
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().timestamp();

        let name2 = name.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO scheduler_jobs (id, name, interval_seconds, created_at) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(name) DO UPDATE SET interval_seconds = excluded.interval_seconds",
                    rusqlite::params![id, name2, interval_seconds as i64, now],
                )?;
                Ok(())
            })
            .await?;

        self.get_by_name(&name).await?.ok_or(StoreError::NotFound {
            entity: "scheduler job",
            id: name,
        })
    }

    /// Enable or disable a job.
    pub async fn set_enabled(&self, job_id: &str, enabled: bool) -> StoreResult<()> {
        let job_id = job_id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE scheduler_jobs SET enabled = ?2 WHERE id = ?1",
                    rusqlite::params![job_id, enabled],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "scheduler job",
                        id: job_id,
                    });
                }
                Ok(())
            })
            .await
    }

    pub async fn get_by_name(&self, name: &str) -> StoreResult<Option<SchedulerJob>> {
        let name = name.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT id, name, interval_seconds, enabled, created_at \
                     FROM scheduler_jobs WHERE name = ?1",
                    rusqlite::params![name],
                    job_from_row,
                );
                match result {
                    Ok(job) => Ok(Some(job)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// All enabled jobs.
    pub async fn list_enabled(&self) -> StoreResult<Vec<SchedulerJob>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, interval_seconds, enabled, created_at \
                     FROM scheduler_jobs WHERE enabled = 1 ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], job_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Record the outcome of one run.
    #[instrument(skip(self))]
    pub async fn record_result(
        &self,
        job_id: &str,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let job_id = job_id.to_string();
        let error = error.map(|s| s.to_string());
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO scheduler_results (job_id, executed_at, success, duration_ms, error) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![job_id, now, success, duration_ms as i64, error],
                )?;
                Ok(())
            })
            .await
    }

    /// Recent results for a job, newest first.
    pub async fn results_for(&self, job_id: &str, limit: u32) -> StoreResult<Vec<SchedulerResult>> {
        let job_id = job_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, job_id, executed_at, success, duration_ms, error \
                     FROM scheduler_results WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![job_id, limit], |row| {
                        Ok(SchedulerResult {
                            id: row.get(0)?,
                            job_id: row.get(1)?,
                            executed_at: row.get(2)?,
                            success: row.get(3)?,
                            duration_ms: row.get::<_, i64>(4)? as u64,
                            error: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SchedulerJob> {
    Ok(SchedulerJob {
        id: row.get(0)?,
        name: row.get(1)?,
        interval_seconds: row.get::<_, i64>(2)? as u64,
        enabled: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SchedulerStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        SchedulerStore::new(db)
    }

    #[tokio::test]
    async fn upsert_preserves_id_and_updates_interval() {
        let store = setup().await;
        let first = store.upsert_job("freshness-decay", 3600).await.unwrap();
        let second = store.upsert_job("freshness-decay", 7200).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.interval_seconds, 7200);
    }

    #[tokio::test]
    async fn zero_interval_rejected() {
        let store = setup().await;
        let result = store.upsert_job("bad", 0).await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn disabled_jobs_are_excluded() {
        let store = setup().await;
        let job = store.upsert_job("embed-retry", 60).await.unwrap();
        store.upsert_job("freshness-decay", 3600).await.unwrap();

        store.set_enabled(&job.id, false).await.unwrap();

        let enabled = store.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "freshness-decay");
    }

    #[tokio::test]
    async fn results_recorded_per_run() {
        let store = setup().await;
        let job = store.upsert_job("embed-retry", 60).await.unwrap();

        store.record_result(&job.id, true, 12, None).await.unwrap();
        store
            .record_result(&job.id, false, 30, Some("backend unavailable"))
            .await
            .unwrap();

        let results = store.results_for(&job.id, 10).await.unwrap();
        assert_eq!(results.len(), 2);
        // Newest first.
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("backend unavailable"));
        assert!(results[1].success);
    }
}
