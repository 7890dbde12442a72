//! Background scheduler for autonomous crawling.
//!
//! Three periodic actions run independently, all gated by the shared
//! [`Controls`]:
//!
//! ```text
//! Scheduler
//!     ├─► discovery (every 6h): enumerate sites → start or jitter-schedule
//!     ├─► reshuffle (every 12h): redraw next-crawl times (desynchronize)
//!     └─► drain     (every 30s): observable tick + indexing apply
//! ```
//!
//! The administrative operations (force-stop, pause-index, resume, cancel)
//! live here too; an external API layer calls them directly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::controls::{Controls, ControlsStatus};
use crate::indexer::Indexer;
use crate::jobs::{CrawlSession, JobStore, SessionJobCounts};
use crate::state::{CrawlProgress, ProgressStore};

const DISCOVERY_CRON: &str = "0 0 */6 * * *";
const RESHUFFLE_CRON: &str = "0 0 */12 * * *";
const DRAIN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// max_depth for sessions the scheduler creates.
    pub default_max_depth: i32,
    /// Jobs applied to the index per drain tick.
    pub index_batch: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_depth: 3,
            index_batch: 50,
        }
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub sites_seen: usize,
    /// Sessions started immediately (never crawled, overdue, or due).
    pub scheduled: usize,
    /// Sites given a fresh jittered next-crawl time.
    pub deferred: usize,
    /// Crawled too recently (under the minimum interval).
    pub skipped_recent: usize,
    /// Already have an active session.
    pub skipped_active: usize,
    pub skipped_disabled: usize,
    /// Waiting on an existing future next-crawl time.
    pub pending: usize,
}

/// Outcome of one drain tick.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DrainReport {
    pub pending: i64,
    pub processing: i64,
    pub indexed: usize,
}

/// Everything an operator wants to know about one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session: CrawlSession,
    pub jobs: SessionJobCounts,
    /// Live view, if the ephemeral record still exists.
    pub progress: Option<CrawlProgress>,
}

pub struct BackgroundScheduler {
    store: Arc<dyn JobStore>,
    progress: Arc<dyn ProgressStore>,
    indexer: Arc<dyn Indexer>,
    controls: Arc<Controls>,
    config: SchedulerConfig,
}

impl BackgroundScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        progress: Arc<dyn ProgressStore>,
        indexer: Arc<dyn Indexer>,
        controls: Arc<Controls>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            progress,
            indexer,
            controls,
            config,
        }
    }

    /// Enumerate registered sites and decide, per site: start a crawl now,
    /// leave it alone, or draw a jittered future crawl time.
    pub async fn discover_and_schedule(&self) -> Result<DiscoveryReport> {
        let (min_hours, max_hours) = self.controls.interval_bounds();
        let sites = self.store.list_sites().await?;
        let now = Utc::now();

        let mut report = DiscoveryReport {
            sites_seen: sites.len(),
            ..DiscoveryReport::default()
        };

        for site in sites {
            if !site.enabled {
                report.skipped_disabled += 1;
                continue;
            }

            // One active crawl per domain: never start a duplicate.
            if self
                .store
                .active_session_for_domain(&site.domain)
                .await?
                .is_some()
            {
                report.skipped_active += 1;
                continue;
            }

            let last = self.store.last_session_for_domain(&site.domain).await?;
            let due = match &last {
                None => true,
                Some(session) => {
                    let elapsed = hours_since(session.started_at, now);
                    if elapsed < min_hours as f64 {
                        report.skipped_recent += 1;
                        continue;
                    }
                    elapsed >= max_hours as f64
                        || site.next_crawl_at.map(|at| at <= now).unwrap_or(false)
                }
            };

            if due {
                match self.start_crawl(&site.domain).await {
                    Ok(_) => report.scheduled += 1,
                    Err(e) => {
                        error!(domain = %site.domain, error = %e, "failed to schedule crawl")
                    }
                }
            } else if site.next_crawl_at.is_none() {
                let at = now + jitter_interval(min_hours, max_hours);
                self.store.set_next_crawl_at(&site.domain, Some(at)).await?;
                debug!(domain = %site.domain, next_crawl_at = %at, "crawl deferred");
                report.deferred += 1;
            } else {
                report.pending += 1;
            }
        }

        info!(
            sites = report.sites_seen,
            scheduled = report.scheduled,
            deferred = report.deferred,
            "auto-discovery complete"
        );
        Ok(report)
    }

    /// Start a crawl session for a domain right now: durable session + root
    /// job, fresh progress record, cleared schedule slot.
    pub async fn start_crawl(&self, domain: &str) -> Result<CrawlSession> {
        let root_url = format!("https://{domain}");
        let session = self
            .store
            .create_session(domain, &root_url, self.config.default_max_depth)
            .await?;
        self.store.set_next_crawl_at(domain, None).await?;

        if let Err(e) = self.progress.start(session.id, domain).await {
            // Progress tracking is optional; the crawl proceeds without it.
            warn!(session_id = %session.id, error = %e, "progress record not created");
        }

        info!(session_id = %session.id, domain, "crawl session scheduled");
        Ok(session)
    }

    /// Redraw next-crawl times for idle sites so long uptimes do not let the
    /// fleet converge on the same crawl instant.
    pub async fn reschedule_random(&self) -> Result<usize> {
        let (min_hours, max_hours) = self.controls.interval_bounds();
        let sites = self.store.list_sites().await?;
        let now = Utc::now();

        let mut rescheduled = 0;
        for site in sites {
            if !site.enabled {
                continue;
            }
            if self
                .store
                .active_session_for_domain(&site.domain)
                .await?
                .is_some()
            {
                continue;
            }
            let at = now + jitter_interval(min_hours, max_hours);
            self.store.set_next_crawl_at(&site.domain, Some(at)).await?;
            rescheduled += 1;
        }

        info!(rescheduled, "crawl schedule reshuffled");
        Ok(rescheduled)
    }

    /// Explicit, externally observable queue tick. Functionally redundant
    /// with the worker's own polling, but it decouples the indexing-apply
    /// cadence from the claim loop and gives operators a heartbeat.
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        let depth = self.store.queue_depth().await?;

        let mut indexed = 0;
        if self.controls.index_allowed() {
            indexed = self.indexer.apply_pending(self.config.index_batch).await?;
        }

        debug!(
            pending = depth.pending,
            processing = depth.processing,
            indexed,
            "queue drain tick"
        );
        Ok(DrainReport {
            pending: depth.pending,
            processing: depth.processing,
            indexed,
        })
    }

    // ========================================================================
    // Administrative operations
    // ========================================================================

    /// Cancel a session: durable terminal transition plus the ephemeral
    /// cancellation flag in-flight jobs observe. Best-effort and idempotent;
    /// returns whether the session was still running.
    pub async fn cancel_session(&self, session_id: Uuid) -> Result<bool> {
        let was_running = self.store.cancel_session(session_id).await?;

        match self.progress.request_cancel(session_id).await {
            Ok(found) => {
                if !found {
                    debug!(session_id = %session_id, "no progress record to cancel");
                }
            }
            Err(e) => {
                // Degraded: in-flight jobs will not see the flag, but the
                // durable store already records the cancellation.
                warn!(session_id = %session_id, error = %e, "cancellation flag not set");
            }
        }

        if was_running {
            info!(session_id = %session_id, "crawl session cancelled");
        }
        Ok(was_running)
    }

    /// Delete a session's ephemeral progress record.
    pub async fn purge_session_state(&self, session_id: Uuid) -> Result<()> {
        self.progress.delete(session_id).await
    }

    pub async fn session_stats(&self, session_id: Uuid) -> Result<Option<SessionStats>> {
        let Some(session) = self.store.session(session_id).await? else {
            return Ok(None);
        };
        let jobs = self.store.count_by_status(session_id).await?;
        let progress = self.progress.get(session_id).await.unwrap_or_else(|e| {
            warn!(session_id = %session_id, error = %e, "progress record unavailable");
            None
        });
        Ok(Some(SessionStats {
            session,
            jobs,
            progress,
        }))
    }

    pub fn force_stop_all(&self) -> ControlsStatus {
        self.controls.force_stop();
        warn!("force stop: worker will claim no new jobs");
        self.controls.status()
    }

    pub fn pause_indexing(&self) -> ControlsStatus {
        self.controls.pause_indexing();
        warn!("indexing paused; crawling continues");
        self.controls.status()
    }

    pub fn resume_all(&self) -> ControlsStatus {
        self.controls.resume();
        info!("crawl and index operations resumed");
        self.controls.status()
    }

    pub fn status(&self) -> ControlsStatus {
        self.controls.status()
    }

    // ========================================================================
    // Periodic wiring
    // ========================================================================

    /// Register the periodic triggers and start the scheduler. The returned
    /// `JobScheduler` must be kept alive; shut it down on exit.
    pub async fn start(self: &Arc<Self>) -> Result<JobScheduler> {
        let scheduler = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;

        let this = Arc::clone(self);
        let discovery = Job::new_async(DISCOVERY_CRON, move |_id, _lock| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                if let Err(e) = this.discover_and_schedule().await {
                    error!(error = %e, "auto-discovery failed");
                }
            })
        })
        .context("Failed to build discovery trigger")?;
        scheduler.add(discovery).await?;

        let this = Arc::clone(self);
        let reshuffle = Job::new_async(RESHUFFLE_CRON, move |_id, _lock| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                if let Err(e) = this.reschedule_random().await {
                    error!(error = %e, "schedule reshuffle failed");
                }
            })
        })
        .context("Failed to build reshuffle trigger")?;
        scheduler.add(reshuffle).await?;

        let this = Arc::clone(self);
        let drain = Job::new_repeated_async(DRAIN_INTERVAL, move |_id, _lock| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                if let Err(e) = this.drain_queue().await {
                    error!(error = %e, "queue drain tick failed");
                }
            })
        })
        .context("Failed to build drain trigger")?;
        scheduler.add(drain).await?;

        scheduler.start().await.context("Failed to start scheduler")?;
        info!(
            discovery = DISCOVERY_CRON,
            reshuffle = RESHUFFLE_CRON,
            drain_secs = DRAIN_INTERVAL.as_secs(),
            "background scheduler started"
        );

        Ok(scheduler)
    }
}

/// Uniform draw from `[min_hours, max_hours]`, minute-granular, so a fleet
/// of domains never converges on the same crawl instant.
fn jitter_interval(min_hours: u32, max_hours: u32) -> chrono::Duration {
    let min_minutes = min_hours as i64 * 60;
    let max_minutes = (max_hours as i64 * 60).max(min_minutes);
    let minutes = {
        let mut rng = rand::thread_rng();
        rng.gen_range(min_minutes..=max_minutes)
    };
    chrono::Duration::minutes(minutes)
}

/// Hours elapsed since a timestamp; used by operator tooling and tests.
pub fn hours_since(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - then).num_minutes() as f64 / 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..200 {
            let d = jitter_interval(4, 24);
            assert!(d >= chrono::Duration::hours(4));
            assert!(d <= chrono::Duration::hours(24));
        }
    }

    #[test]
    fn test_jitter_degenerate_range() {
        let d = jitter_interval(6, 6);
        assert_eq!(d, chrono::Duration::hours(6));
    }

    #[test]
    fn test_hours_since() {
        let now = Utc::now();
        let then = now - chrono::Duration::minutes(90);
        assert!((hours_since(then, now) - 1.5).abs() < 0.01);
    }
}
