//! Fault-isolated interval scheduler.
//!
//! Each registered job runs on its own tokio interval loop, so one job's
//! failures or slowness never perturb another job's cadence. Overlapping
//! runs of the same job are skipped (running-set guard) rather than queued,
//! and every executed run writes exactly one result row.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flowsmith_store::SchedulerStore;

use crate::error::{Result, SchedulerError};

/// A job's async body. Returning `Err` records a failure result; the job
/// keeps its schedule either way.
pub type JobHandler =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Interval scheduler over persistent job definitions.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: SchedulerStore,

    /// Registered handlers keyed by job id.
    handlers: DashMap<String, JobHandler>,

    /// Guard against overlapping runs of the same job, keyed by job id.
    running: DashMap<String, ()>,

    /// Loop handles, kept so shutdown can be awaited.
    loops: std::sync::Mutex<Vec<JoinHandle<()>>>,

    /// When `true`, loops exit at their next wakeup.
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl Scheduler {
    pub fn new(store: SchedulerStore) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                handlers: DashMap::new(),
                running: DashMap::new(),
                loops: std::sync::Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
            }),
        }
    }

    /// Register a job and start its interval loop.
    ///
    /// The definition is upserted into the store, so the interval survives
    /// restarts and results attach to a stable job id. The first run happens
    /// one full interval after registration.
    pub async fn register(
        &self,
        name: &str,
        interval: Duration,
        handler: JobHandler,
    ) -> Result<String> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::Shutdown);
        }

        let job = self
            .inner
            .store
            .upsert_job(name, interval.as_secs().max(1))
            .await?;
        let job_id = job.id.clone();
        self.inner.handlers.insert(job_id.clone(), handler);

        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        let loop_job_id = job_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // A run that overruns its interval skips the missed ticks instead
            // of bursting to catch up.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick; runs start one interval in.
            ticker.tick().await;

            info!(job = %name, interval_secs = interval.as_secs(), "scheduler job loop started");
            loop {
                tokio::select! {
                    _ = inner.shutdown_notify.notified() => break,
                    _ = ticker.tick() => {
                        if inner.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        Self::run_once(&inner, &loop_job_id, &name).await;
                    }
                }
            }
            info!(job = %name, "scheduler job loop stopped");
        });

        self.inner
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);

        Ok(job_id)
    }

    /// Enable or disable a job. Disabled jobs tick but do not run.
    pub async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<()> {
        self.inner.store.set_enabled(job_id, enabled).await?;
        Ok(())
    }

    /// Signal every loop to stop and wait for them to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.shutdown_notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self
                .inner
                .loops
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ── internals ────────────────────────────────────────────────────

    async fn run_once(inner: &SchedulerInner, job_id: &str, name: &str) {
        // Disabled jobs keep ticking but do nothing.
        match inner.store.get_by_name(name).await {
            Ok(Some(job)) if !job.enabled => {
                debug!(job = %name, "job disabled, skipping run");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(job = %name, %err, "failed to read job definition, skipping run");
                return;
            }
        }

        // Skip-if-running: overlapping runs of the same job are dropped,
        // not queued. A skip leaves no result row.
        if inner.running.insert(job_id.to_string(), ()).is_some() {
            debug!(job = %name, "previous run still in flight, skipping");
            return;
        }

        let Some(handler) = inner.handlers.get(job_id).map(|h| Arc::clone(&h)) else {
            inner.running.remove(job_id);
            return;
        };

        let started = Instant::now();
        // Run the handler on its own task so a panic is contained to this
        // run and surfaces as a failure result.
        let outcome = match tokio::spawn(handler()).await {
            Ok(result) => result,
            Err(join_err) => Err(format!("job panicked: {join_err}")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (success, error) = match &outcome {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg.as_str())),
        };
        if let Err(err) = inner
            .store
            .record_result(job_id, success, duration_ms, error)
            .await
        {
            warn!(job = %name, %err, "failed to record scheduler result");
        }

        match outcome {
            Ok(()) => debug!(job = %name, duration_ms, "job run succeeded"),
            Err(msg) => warn!(job = %name, duration_ms, error = %msg, "job run failed"),
        }

        inner.running.remove(job_id);
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use flowsmith_store::Database;
    use std::sync::atomic::AtomicUsize;

    async fn setup() -> (Scheduler, SchedulerStore) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = SchedulerStore::new(db);
        (Scheduler::new(store.clone()), store)
    }

    fn counting_handler(counter: Arc<AtomicUsize>, fail: bool) -> JobHandler {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err("handler always fails".to_string())
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn one_result_row_per_run() {
        let (scheduler, store) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let job_id = scheduler
            .register("healthy", Duration::from_secs(60), counting_handler(runs.clone(), false))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60 * 3 + 5)).await;
        scheduler.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let results = store.results_for(&job_id, 100).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_does_not_perturb_healthy_job() {
        let (scheduler, store) = setup().await;
        let failing_runs = Arc::new(AtomicUsize::new(0));
        let healthy_runs = Arc::new(AtomicUsize::new(0));

        let failing_id = scheduler
            .register("failing", Duration::from_secs(60), counting_handler(failing_runs.clone(), true))
            .await
            .unwrap();
        let healthy_id = scheduler
            .register("second", Duration::from_secs(60), counting_handler(healthy_runs.clone(), false))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60 * 5 + 5)).await;
        scheduler.shutdown().await;

        let failing = store.results_for(&failing_id, 100).await.unwrap();
        let healthy = store.results_for(&healthy_id, 100).await.unwrap();

        assert_eq!(failing.len(), 5);
        assert!(failing.iter().all(|r| !r.success));
        assert!(failing.iter().all(|r| r.error.is_some()));

        assert_eq!(healthy.len(), 5);
        assert!(healthy.iter().all(|r| r.success));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_runs_are_skipped_not_queued() {
        let (scheduler, store) = setup().await;
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let handler: JobHandler = {
            let active = Arc::clone(&active);
            let overlapped = Arc::clone(&overlapped);
            let runs = Arc::clone(&runs);
            Arc::new(move || {
                let active = Arc::clone(&active);
                let overlapped = Arc::clone(&overlapped);
                let runs = Arc::clone(&runs);
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    // Far longer than the interval.
                    tokio::time::sleep(Duration::from_secs(150)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };

        let job_id = scheduler
            .register("slow", Duration::from_secs(60), handler)
            .await
            .unwrap();

        // Ticks would land at 60s, 120s, ... but each run takes 150s; the
        // intervening ticks are skipped, not queued.
        tokio::time::sleep(Duration::from_secs(410)).await;
        scheduler.shutdown().await;

        assert!(!overlapped.load(Ordering::SeqCst), "two runs overlapped");
        let ticks = 6;
        assert!(runs.load(Ordering::SeqCst) < ticks);
        // Skipped ticks leave no result rows.
        assert_eq!(
            store.results_for(&job_id, 100).await.unwrap().len(),
            runs.load(Ordering::SeqCst)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_job_stops_running() {
        let (scheduler, store) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let job_id = scheduler
            .register("toggled", Duration::from_secs(60), counting_handler(runs.clone(), false))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.set_enabled(&job_id, false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60 * 3)).await;
        scheduler.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(store.results_for(&job_id, 100).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn register_after_shutdown_rejected() {
        let (scheduler, _store) = setup().await;
        scheduler.shutdown().await;

        let result = scheduler
            .register("late", Duration::from_secs(60), counting_handler(Arc::new(AtomicUsize::new(0)), false))
            .await;
        assert!(matches!(result, Err(SchedulerError::Shutdown)));
    }
}
