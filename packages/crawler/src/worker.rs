//! Crawl worker: the polling/claim/execute loop.
//!
//! A single coordinating loop claims pending jobs from the job store and
//! runs each one as an independent task, bounded by `max_concurrent_jobs`.
//! Claims are atomic (the store guarantees exclusivity), cancellation is
//! cooperative (checked per page and per batch), and an empty queue widens
//! the poll interval instead of hot-looping.
//!
//! ```text
//! CrawlWorker
//!     │
//!     ├─► reap finished job tasks (JoinSet)
//!     ├─► claim up to `available` jobs (skipped when force-stopped)
//!     │       └─► process_job: cancel-check → fetch → score links
//!     │               └─► finish_job: one committed unit
//!     └─► sleep (adaptive: 5s → +2s per idle poll → 30s cap)
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use page_fetch::{PageFetcher, PageScorer};

use crate::controls::Controls;
use crate::jobs::{ChildLink, CrawlJob, JobStore, PageOutcome, QueueDepth};
use crate::state::{ProgressDelta, ProgressStore};

/// Configuration for the crawl worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent crawl jobs in flight.
    pub max_concurrent_jobs: usize,
    /// Base poll interval when work is available.
    pub poll_interval: Duration,
    /// Added to the delay per consecutive idle poll.
    pub backoff_step: Duration,
    /// Ceiling for the adaptive poll delay.
    pub max_poll_interval: Duration,
    /// How long to wait for in-flight jobs on shutdown before aborting.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            poll_interval: Duration::from_secs(5),
            backoff_step: Duration::from_secs(2),
            max_poll_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Adaptive poll delay: widens while the queue stays empty, snaps back to
/// the base interval as soon as work appears.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    step: Duration,
    cap: Duration,
    idle_polls: u32,
}

impl PollBackoff {
    pub fn new(base: Duration, step: Duration, cap: Duration) -> Self {
        Self {
            base,
            step,
            cap,
            idle_polls: 0,
        }
    }

    pub fn current(&self) -> Duration {
        (self.base + self.step * self.idle_polls).min(self.cap)
    }

    /// An empty poll with no active work: widen the delay.
    pub fn record_idle(&mut self) -> Duration {
        self.idle_polls = self.idle_polls.saturating_add(1);
        self.current()
    }

    /// Work was found: reset to the base interval.
    pub fn record_busy(&mut self) -> Duration {
        self.idle_polls = 0;
        self.base
    }
}

/// Worker performance counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerMetrics {
    pub total_processed: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    /// Children enqueued by completed jobs.
    pub total_queued: u64,
    pub avg_job_ms: f64,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    total_job_ms: f64,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self {
            total_processed: 0,
            total_successful: 0,
            total_failed: 0,
            total_queued: 0,
            avg_job_ms: 0.0,
            started_at: Utc::now(),
            total_job_ms: 0.0,
        }
    }
}

impl WorkerMetrics {
    fn record(&mut self, success: bool, elapsed_ms: f64, children: u64) {
        self.total_processed += 1;
        if success {
            self.total_successful += 1;
        } else {
            self.total_failed += 1;
        }
        self.total_queued += children;
        self.total_job_ms += elapsed_ms;
        self.avg_job_ms = self.total_job_ms / self.total_processed as f64;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_processed == 0 {
            return 0.0;
        }
        self.total_successful as f64 / self.total_processed as f64 * 100.0
    }
}

/// Point-in-time worker status for observability.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub is_running: bool,
    pub active_jobs: usize,
    pub available_slots: usize,
    pub max_concurrent_jobs: usize,
    pub poll_interval_secs: u64,
    pub queue: QueueDepth,
    pub metrics: WorkerMetrics,
}

enum JobVerdict {
    Completed { children: u64 },
    Failed,
    Cancelled,
}

/// Everything a spawned job task needs, cloneable into the task.
#[derive(Clone)]
struct JobContext {
    store: Arc<dyn JobStore>,
    progress: Arc<dyn ProgressStore>,
    fetcher: Arc<dyn PageFetcher>,
    scorer: Arc<dyn PageScorer>,
    metrics: Arc<Mutex<WorkerMetrics>>,
}

impl JobContext {
    async fn process(self, job: CrawlJob) {
        let started = Instant::now();
        let verdict = self.execute(&job).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (success, children) = match verdict {
            JobVerdict::Completed { children } => (true, children),
            JobVerdict::Failed | JobVerdict::Cancelled => (false, 0),
        };
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.record(success, elapsed_ms, children);
        }

        // If this job closed out its session, stamp the live record too so
        // observers see the terminal status without hitting the database.
        if let Ok(Some(session)) = self.store.session(job.session_id).await {
            if !session.is_active() {
                if let Err(e) = self.progress.finish(job.session_id, session.status).await {
                    warn!(session_id = %job.session_id, error = %e, "progress finish dropped");
                }
            }
        }

        debug!(
            job_id = %job.id,
            success,
            elapsed_ms = elapsed_ms as u64,
            children,
            "job finished"
        );
    }

    async fn execute(&self, job: &CrawlJob) -> JobVerdict {
        // Per-page check bounds cancel latency to at most one page fetch.
        if self.cancelled(job.session_id).await {
            self.fail_job(job, "cancelled").await;
            self.report(job.session_id, ProgressDelta::skipped(), None).await;
            return JobVerdict::Cancelled;
        }

        let url = match Url::parse(&job.url) {
            Ok(url) => url,
            Err(e) => {
                self.fail_job(job, &format!("invalid url: {e}")).await;
                self.report(job.session_id, ProgressDelta::failed(), None).await;
                return JobVerdict::Failed;
            }
        };

        let page = match self.fetcher.fetch(&url).await {
            Ok(page) => page,
            Err(e) => {
                warn!(job_id = %job.id, url = %job.url, error = %e, "fetch failed");
                self.fail_job(job, &e.to_string()).await;
                self.report(job.session_id, ProgressDelta::failed(), None).await;
                return JobVerdict::Failed;
            }
        };

        let outcome = PageOutcome {
            title: page.title.clone(),
            description: page.description.clone(),
            word_count: page.word_count as i32,
        };

        // Hard depth ceiling: never build a child whose depth would exceed
        // the session's max_depth.
        let mut children: Vec<ChildLink> = Vec::new();
        if job.can_expand() {
            for link in page.same_domain_links(&job.domain) {
                let priority = self.scorer.priority(&link, &page);
                children.push(ChildLink {
                    url: link.to_string(),
                    priority,
                });
            }
        }

        // Coarse post-fetch re-check: the network cost is already paid, so
        // the page's analysis is persisted either way, but a cancellation
        // that landed mid-fetch suppresses new children.
        if !children.is_empty() && self.cancelled(job.session_id).await {
            children.clear();
        }

        match self.store.finish_job(job, &outcome, &children).await {
            Ok(inserted) => {
                self.report(
                    job.session_id,
                    ProgressDelta::crawled(),
                    Some(job.url.as_str()),
                )
                .await;
                JobVerdict::Completed { children: inserted }
            }
            Err(e) => {
                // Store outage; the committed unit never happened, so the
                // job row is untouched. Nothing more to do this tick.
                error!(job_id = %job.id, error = %e, "failed to persist job result");
                JobVerdict::Failed
            }
        }
    }

    /// Cancellation is a safety valve, not a dependency of correctness: an
    /// unreachable state store reads as "not cancelled".
    async fn cancelled(&self, session_id: Uuid) -> bool {
        match self.progress.is_cancelled(session_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "cancellation state unavailable");
                false
            }
        }
    }

    async fn fail_job(&self, job: &CrawlJob, reason: &str) {
        if let Err(e) = self.store.fail(job.id, reason).await {
            error!(job_id = %job.id, error = %e, "failed to mark job as failed");
        }
    }

    async fn report(&self, session_id: Uuid, delta: ProgressDelta, current_url: Option<&str>) {
        if let Err(e) = self
            .progress
            .update_progress(session_id, delta, current_url)
            .await
        {
            warn!(session_id = %session_id, error = %e, "progress update dropped");
        }
    }
}

/// The long-lived crawl worker service.
pub struct CrawlWorker {
    ctx: JobContext,
    controls: Arc<Controls>,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
    active_gauge: Arc<AtomicUsize>,
}

impl CrawlWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        progress: Arc<dyn ProgressStore>,
        fetcher: Arc<dyn PageFetcher>,
        scorer: Arc<dyn PageScorer>,
        controls: Arc<Controls>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            ctx: JobContext {
                store,
                progress,
                fetcher,
                scorer,
                metrics: Arc::new(Mutex::new(WorkerMetrics::default())),
            },
            controls,
            config,
            running: Arc::new(AtomicBool::new(false)),
            active_gauge: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A cloneable handle for observing the worker while it runs.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            store: Arc::clone(&self.ctx.store),
            metrics: Arc::clone(&self.ctx.metrics),
            running: Arc::clone(&self.running),
            active: Arc::clone(&self.active_gauge),
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            poll_interval: self.config.poll_interval,
        }
    }

    /// Run until the token is cancelled, then drain in-flight jobs.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "crawl worker started"
        );
        self.running.store(true, Ordering::SeqCst);

        let mut active: JoinSet<()> = JoinSet::new();
        let mut backoff = PollBackoff::new(
            self.config.poll_interval,
            self.config.backoff_step,
            self.config.max_poll_interval,
        );

        loop {
            // Reap finished job tasks.
            while let Some(result) = active.try_join_next() {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(error = %e, "job task panicked");
                    }
                }
            }

            let available = self
                .config
                .max_concurrent_jobs
                .saturating_sub(active.len());

            // Controls are read fresh every iteration so force_stop takes
            // effect within one poll cycle.
            let mut claimed = 0;
            if available > 0 && self.controls.crawl_allowed() {
                match self.ctx.store.claim_next(available as i64, None).await {
                    Ok(jobs) => {
                        claimed = jobs.len();
                        if claimed > 0 {
                            debug!(
                                count = claimed,
                                active = active.len(),
                                "claimed jobs"
                            );
                        }
                        for job in jobs {
                            let ctx = self.ctx.clone();
                            active.spawn(ctx.process(job));
                        }
                    }
                    Err(e) => {
                        // Store outage: abort this iteration, retry next tick.
                        error!(error = %e, "failed to claim jobs");
                    }
                }
            }
            self.active_gauge.store(active.len(), Ordering::SeqCst);

            let delay = if claimed > 0 {
                backoff.record_busy()
            } else if active.is_empty() {
                backoff.record_idle()
            } else {
                backoff.current()
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // Graceful shutdown: stop claiming, await in-flight jobs.
        if !active.is_empty() {
            info!(active = active.len(), "waiting for in-flight jobs");
            let drain = async {
                while active.join_next().await.is_some() {}
            };
            if tokio::time::timeout(self.config.shutdown_grace, drain)
                .await
                .is_err()
            {
                warn!("in-flight jobs did not finish in time; aborting");
                active.abort_all();
                while active.join_next().await.is_some() {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.active_gauge.store(0, Ordering::SeqCst);

        let metrics = self
            .ctx
            .metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        info!(
            total_processed = metrics.total_processed,
            total_successful = metrics.total_successful,
            total_failed = metrics.total_failed,
            "crawl worker stopped"
        );

        Ok(())
    }
}

/// Cloneable observer handle for a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    store: Arc<dyn JobStore>,
    metrics: Arc<Mutex<WorkerMetrics>>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    max_concurrent_jobs: usize,
    poll_interval: Duration,
}

impl WorkerHandle {
    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub async fn status(&self) -> Result<WorkerStatus> {
        let queue = self.store.queue_depth().await?;
        let active_jobs = self.active.load(Ordering::SeqCst);
        Ok(WorkerStatus {
            is_running: self.running.load(Ordering::SeqCst),
            active_jobs,
            available_slots: self.max_concurrent_jobs.saturating_sub(active_jobs),
            max_concurrent_jobs: self.max_concurrent_jobs,
            poll_interval_secs: self.poll_interval.as_secs(),
            queue,
            metrics: self.metrics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_widens_and_holds_at_cap() {
        let mut backoff = PollBackoff::new(
            Duration::from_secs(5),
            Duration::from_secs(2),
            Duration::from_secs(30),
        );
        assert_eq!(backoff.current(), Duration::from_secs(5));

        let mut observed = Vec::new();
        for _ in 0..15 {
            observed.push(backoff.record_idle().as_secs());
        }
        assert_eq!(
            &observed[..5],
            &[7, 9, 11, 13, 15],
            "delay widens by the step"
        );
        assert_eq!(observed[12], 30);
        assert_eq!(observed[14], 30, "delay holds at the cap");
    }

    #[test]
    fn test_backoff_resets_on_work() {
        let mut backoff = PollBackoff::new(
            Duration::from_secs(5),
            Duration::from_secs(2),
            Duration::from_secs(30),
        );
        for _ in 0..10 {
            backoff.record_idle();
        }
        assert_eq!(backoff.record_busy(), Duration::from_secs(5));
        assert_eq!(backoff.record_idle(), Duration::from_secs(7));
    }

    #[test]
    fn test_metrics_average_and_success_rate() {
        let mut metrics = WorkerMetrics::default();
        metrics.record(true, 100.0, 4);
        metrics.record(true, 200.0, 0);
        metrics.record(false, 300.0, 0);

        assert_eq!(metrics.total_processed, 3);
        assert_eq!(metrics.total_successful, 2);
        assert_eq!(metrics.total_failed, 1);
        assert_eq!(metrics.total_queued, 4);
        assert!((metrics.avg_job_ms - 200.0).abs() < f64::EPSILON);
        assert!((metrics.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_default_config_matches_deployment_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_poll_interval, Duration::from_secs(30));
    }
}
