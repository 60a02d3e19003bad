//! Ingress facade.
//!
//! [`DesignService`] is the surface callers talk to: submit a design
//! request, poll the resulting job, search the knowledge base, cancel.
//! Submission only enqueues; the worker pool does the actual generation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use flowsmith_retrieval::{RetrievalEngine, SearchHit};
use flowsmith_store::{GenerationJob, JobStore};

use crate::error::{PipelineError, Result};
use crate::stages::DesignRequest;
use crate::worker::WorkerPool;

/// Public operations of the generation service.
#[derive(Clone)]
pub struct DesignService {
    jobs: JobStore,
    retrieval: Arc<RetrievalEngine>,
    pool: WorkerPool,
}

impl DesignService {
    pub fn new(jobs: JobStore, retrieval: Arc<RetrievalEngine>, pool: WorkerPool) -> Self {
        Self {
            jobs,
            retrieval,
            pool,
        }
    }

    /// Enqueue a design request and return the queued job immediately.
    #[instrument(skip(self, request), fields(goal = %request.user_goal))]
    pub async fn submit_design_request(&self, request: DesignRequest) -> Result<GenerationJob> {
        if request.user_goal.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "user_goal must not be empty".into(),
            ));
        }
        if request.auto_activate && !request.auto_stage {
            return Err(PipelineError::InvalidRequest(
                "auto_activate requires auto_stage".into(),
            ));
        }
        let job = self.jobs.enqueue(serde_json::to_value(&request)?).await?;
        info!(job_id = %job.id, "design request accepted");
        Ok(job)
    }

    /// Submit and block until the job reaches a terminal state.
    pub async fn submit_and_wait(
        &self,
        request: DesignRequest,
        timeout: Duration,
    ) -> Result<GenerationJob> {
        let job = self.submit_design_request(request).await?;
        self.wait_for_job(&job.id, timeout).await
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<GenerationJob>> {
        Ok(self.jobs.get(job_id).await?)
    }

    /// Semantic search over the knowledge base.
    pub async fn search_knowledge(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        Ok(self.retrieval.search(query, top_k).await?)
    }

    /// Request cancellation of a job. Takes effect at the next stage
    /// boundary.
    pub fn cancel(&self, job_id: &str) {
        self.pool.cancel(job_id);
    }

    /// Poll until the job reaches a terminal state or `timeout` elapses.
    pub async fn wait_for_job(&self, job_id: &str, timeout: Duration) -> Result<GenerationJob> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| PipelineError::InvalidRequest(format!("unknown job: {job_id}")))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PipelineError::External {
                    reason: format!("job {job_id} did not finish within {timeout:?}"),
                    retryable: false,
                });
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
