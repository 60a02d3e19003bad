//! Job workers.
//!
//! Workers poll the queue, claim jobs through the store's guarded UPDATE
//! (so two workers never run the same job), and drive the staged pipeline.
//! A panic inside one job is contained: the job is marked failed and the
//! worker keeps polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use flowsmith_store::{GenerationJob, JobStore};

use crate::cancel::CancellationFlag;
use crate::error::Result;
use crate::stages::{DesignRequest, GenerationPipeline};

/// How often an idle worker polls for queued jobs.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct PoolInner {
    jobs: JobStore,
    pipeline: Arc<GenerationPipeline>,
    /// One cancellation flag per in-flight (or about-to-run) job.
    flags: DashMap<String, CancellationFlag>,
    poll_interval: Duration,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// A pool of generation workers over one shared job queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(jobs: JobStore, pipeline: Arc<GenerationPipeline>) -> Self {
        Self::with_poll_interval(jobs, pipeline, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        jobs: JobStore,
        pipeline: Arc<GenerationPipeline>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                jobs,
                pipeline,
                flags: DashMap::new(),
                poll_interval,
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                workers: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn `count` polling workers.
    pub fn start(&self, count: usize) {
        let mut workers = match self.inner.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for n in 0..count {
            let inner = Arc::clone(&self.inner);
            let name = format!("worker-{n}");
            workers.push(tokio::spawn(async move {
                worker_loop(inner, name).await;
            }));
        }
    }

    /// Claim and run at most one queued job. Returns the job id when one was
    /// processed.
    pub async fn run_once(&self, worker: &str) -> Result<Option<String>> {
        match self.inner.jobs.claim_next(worker).await? {
            Some(job) => {
                let id = job.id.clone();
                process_job(&self.inner, job).await;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Request cancellation of a job. Takes effect at the next stage
    /// boundary; a job canceled before it is claimed stops immediately on
    /// claim.
    pub fn cancel(&self, job_id: &str) {
        self.inner
            .flags
            .entry(job_id.to_string())
            .or_default()
            .cancel();
        info!(job_id, "job cancellation requested");
    }

    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();
        let workers = {
            let mut guard = match self.inner.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(inner: Arc<PoolInner>, name: String) {
    info!(worker = %name, "worker started");
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match inner.jobs.claim_next(&name).await {
            Ok(Some(job)) => process_job(&inner, job).await,
            Ok(None) => {
                tokio::select! {
                    _ = inner.shutdown_notify.notified() => {}
                    _ = tokio::time::sleep(inner.poll_interval) => {}
                }
            }
            Err(e) => {
                error!(worker = %name, %e, "claim failed, backing off");
                tokio::time::sleep(inner.poll_interval).await;
            }
        }
    }
    info!(worker = %name, "worker stopped");
}

#[instrument(skip(inner, job), fields(job_id = %job.id))]
async fn process_job(inner: &Arc<PoolInner>, job: GenerationJob) {
    let flag = inner.flags.entry(job.id.clone()).or_default().clone();

    let request: DesignRequest = match serde_json::from_value(job.request.clone()) {
        Ok(request) => request,
        Err(e) => {
            record_failure(inner, &job.id, None, &format!("invalid request: {e}")).await;
            inner.flags.remove(&job.id);
            return;
        }
    };

    // The pipeline runs in its own task so a panic inside a stage fails the
    // job instead of killing the worker.
    let pipeline = Arc::clone(&inner.pipeline);
    let run_flag = flag.clone();
    let run = tokio::spawn(async move { pipeline.run(&request, &run_flag).await });

    match run.await {
        Ok(Ok(outcome)) => {
            if let Err(e) = inner
                .jobs
                .complete(&job.id, &outcome.workflow_id, outcome.result)
                .await
            {
                error!(job_id = %job.id, %e, "failed to record job completion");
            } else {
                info!(job_id = %job.id, workflow_id = %outcome.workflow_id, "job succeeded");
            }
        }
        Ok(Err((workflow_id, e))) => {
            warn!(job_id = %job.id, %e, "job failed");
            record_failure(inner, &job.id, workflow_id.as_deref(), &e.failure_reason()).await;
        }
        Err(join_err) => {
            error!(job_id = %job.id, %join_err, "job panicked");
            record_failure(inner, &job.id, None, "job panicked").await;
        }
    }
    inner.flags.remove(&job.id);
}

async fn record_failure(
    inner: &Arc<PoolInner>,
    job_id: &str,
    workflow_id: Option<&str>,
    reason: &str,
) {
    if let Err(e) = inner.jobs.fail(job_id, workflow_id, reason).await {
        error!(job_id, %e, "failed to record job failure");
    }
}
