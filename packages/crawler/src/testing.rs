//! In-memory trait implementations for tests.
//!
//! The worker and scheduler are exercised end-to-end against these instead
//! of Postgres/Redis. `MemoryJobStore` reproduces the production claim
//! semantics (mutually exclusive claims, priority ordering, idempotent
//! terminal transitions, per-session URL dedupe, close-if-drained) behind a
//! mutex, so the concurrency properties under test are real.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

use page_fetch::{FetchError, FetchedPage, PageFetcher, PageScorer};

use crate::indexer::Indexer;
use crate::jobs::{
    ChildLink, CrawlJob, CrawlSession, JobStatus, JobStore, PageOutcome, QueueDepth,
    SessionJobCounts, SessionStatus, Site,
};
use crate::state::{CrawlProgress, ProgressDelta, ProgressStore};

// ============================================================================
// Job store
// ============================================================================

#[derive(Default)]
struct JobStoreInner {
    sessions: HashMap<Uuid, CrawlSession>,
    jobs: HashMap<Uuid, CrawlJob>,
    sites: BTreeMap<String, Site>,
}

impl JobStoreInner {
    fn close_session_if_drained(&mut self, session_id: Uuid) {
        let mut pending_or_processing = 0;
        let mut completed = 0;
        for job in self.jobs.values().filter(|j| j.session_id == session_id) {
            match job.status {
                JobStatus::Pending | JobStatus::Processing => pending_or_processing += 1,
                JobStatus::Completed => completed += 1,
                JobStatus::Failed => {}
            }
        }
        if pending_or_processing > 0 {
            return;
        }
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.status == SessionStatus::Running {
                session.status = if completed > 0 {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                };
                session.ended_at.get_or_insert_with(Utc::now);
            }
        }
    }

    fn url_exists(&self, session_id: Uuid, url: &str) -> bool {
        self.jobs
            .values()
            .any(|j| j.session_id == session_id && j.url == url)
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<JobStoreInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JobStoreInner> {
        self.inner.lock().expect("job store lock poisoned")
    }

    // ---- raw seeding/inspection helpers for tests ----

    pub fn insert_session(&self, session: CrawlSession) {
        self.lock().sessions.insert(session.id, session);
    }

    pub fn insert_job(&self, job: CrawlJob) {
        self.lock().jobs.insert(job.id, job);
    }

    pub fn insert_site(&self, domain: &str, enabled: bool, next_crawl_at: Option<DateTime<Utc>>) {
        let site = Site {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            enabled,
            next_crawl_at,
            created_at: Utc::now(),
        };
        self.lock().sites.insert(site.domain.clone(), site);
    }

    pub fn job(&self, job_id: Uuid) -> Option<CrawlJob> {
        self.lock().jobs.get(&job_id).cloned()
    }

    pub fn session_snapshot(&self, session_id: Uuid) -> Option<CrawlSession> {
        self.lock().sessions.get(&session_id).cloned()
    }

    pub fn jobs_for_session(&self, session_id: Uuid) -> Vec<CrawlJob> {
        self.lock()
            .jobs
            .values()
            .filter(|j| j.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn site(&self, domain: &str) -> Option<Site> {
        self.lock().sites.get(domain).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_session(
        &self,
        domain: &str,
        root_url: &str,
        max_depth: i32,
    ) -> Result<CrawlSession> {
        let session = CrawlSession::new(domain, max_depth);
        let root = CrawlJob::root(&session, root_url);
        let mut inner = self.lock();
        inner.sessions.insert(session.id, session.clone());
        inner.jobs.insert(root.id, root);
        Ok(session)
    }

    async fn claim_next(&self, limit: i64, domain: Option<&str>) -> Result<Vec<CrawlJob>> {
        let mut inner = self.lock();
        let now = Utc::now();

        let mut candidates: Vec<(i32, DateTime<Utc>, Uuid)> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .filter(|j| domain.map(|d| j.domain == d).unwrap_or(true))
            .map(|j| (j.priority, j.created_at, j.id))
            .collect();
        // priority descending, then created_at ascending (older wins ties)
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.updated_at = Utc::now();
        let session_id = job.session_id;
        inner.close_session_if_drained(session_id);
        Ok(true)
    }

    async fn fail(&self, job_id: Uuid, reason: &str) -> Result<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(reason.to_string());
        job.completed_at = Some(Utc::now());
        job.updated_at = Utc::now();
        let session_id = job.session_id;
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.pages_failed += 1;
        }
        inner.close_session_if_drained(session_id);
        Ok(true)
    }

    async fn finish_job(
        &self,
        job: &CrawlJob,
        outcome: &PageOutcome,
        children: &[ChildLink],
    ) -> Result<u64> {
        let mut inner = self.lock();
        let Some(stored) = inner.jobs.get_mut(&job.id) else {
            return Ok(0);
        };
        if stored.status.is_terminal() {
            return Ok(0);
        }
        stored.status = JobStatus::Completed;
        stored.title = outcome.title.clone();
        stored.description = outcome.description.clone();
        stored.word_count = outcome.word_count;
        stored.indexed = false;
        stored.completed_at = Some(Utc::now());
        stored.updated_at = Utc::now();

        if let Some(session) = inner.sessions.get_mut(&job.session_id) {
            session.pages_crawled += 1;
        }

        let mut inserted = 0;
        if job.can_expand() {
            for link in children {
                if inner.url_exists(job.session_id, &link.url) {
                    continue;
                }
                let child = job.child(&link.url, link.priority);
                inner.jobs.insert(child.id, child);
                inserted += 1;
            }
        }

        inner.close_session_if_drained(job.session_id);
        Ok(inserted)
    }

    async fn enqueue_children(&self, parent: &CrawlJob, children: &[ChildLink]) -> Result<u64> {
        if !parent.can_expand() {
            return Ok(0);
        }
        let mut inner = self.lock();
        let mut inserted = 0;
        for link in children {
            if inner.url_exists(parent.session_id, &link.url) {
                continue;
            }
            let child = parent.child(&link.url, link.priority);
            inner.jobs.insert(child.id, child);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn count_by_status(&self, session_id: Uuid) -> Result<SessionJobCounts> {
        let inner = self.lock();
        let mut counts = SessionJobCounts::default();
        for job in inner.jobs.values().filter(|j| j.session_id == session_id) {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn session(&self, session_id: Uuid) -> Result<Option<CrawlSession>> {
        Ok(self.lock().sessions.get(&session_id).cloned())
    }

    async fn cancel_session(&self, session_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if session.status != SessionStatus::Running {
            return Ok(false);
        }
        session.status = SessionStatus::Cancelled;
        session.cancelled_at = Some(Utc::now());
        session.ended_at.get_or_insert_with(Utc::now);
        Ok(true)
    }

    async fn active_session_for_domain(&self, domain: &str) -> Result<Option<CrawlSession>> {
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|s| s.domain == domain && s.status == SessionStatus::Running)
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn last_session_for_domain(&self, domain: &str) -> Result<Option<CrawlSession>> {
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|s| s.domain == domain)
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn queue_depth(&self) -> Result<QueueDepth> {
        let inner = self.lock();
        let mut depth = QueueDepth::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => depth.pending += 1,
                JobStatus::Processing => depth.processing += 1,
                _ => {}
            }
        }
        Ok(depth)
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        Ok(self.lock().sites.values().cloned().collect())
    }

    async fn register_site(&self, domain: &str) -> Result<Site> {
        let mut inner = self.lock();
        let site = inner
            .sites
            .entry(domain.to_string())
            .or_insert_with(|| Site {
                id: Uuid::new_v4(),
                domain: domain.to_string(),
                enabled: true,
                next_crawl_at: None,
                created_at: Utc::now(),
            });
        Ok(site.clone())
    }

    async fn set_next_crawl_at(&self, domain: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        if let Some(site) = self.lock().sites.get_mut(domain) {
            site.next_crawl_at = at;
        }
        Ok(())
    }
}

// ============================================================================
// Progress store
// ============================================================================

#[derive(Default)]
pub struct MemoryProgressStore {
    records: Mutex<HashMap<Uuid, CrawlProgress>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, CrawlProgress>> {
        self.records.lock().expect("progress store lock poisoned")
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn start(&self, session_id: Uuid, domain: &str) -> Result<()> {
        self.lock()
            .insert(session_id, CrawlProgress::new(session_id, domain));
        Ok(())
    }

    async fn update_progress(
        &self,
        session_id: Uuid,
        delta: ProgressDelta,
        current_url: Option<&str>,
    ) -> Result<()> {
        if let Some(progress) = self.lock().get_mut(&session_id) {
            progress.apply(delta, current_url);
        }
        Ok(())
    }

    async fn request_cancel(&self, session_id: Uuid) -> Result<bool> {
        let mut records = self.lock();
        let Some(progress) = records.get_mut(&session_id) else {
            return Ok(false);
        };
        progress.cancelled = true;
        progress.cancelled_at = Some(Utc::now());
        progress.status = SessionStatus::Cancelled;
        Ok(true)
    }

    async fn is_cancelled(&self, session_id: Uuid) -> Result<bool> {
        Ok(self
            .lock()
            .get(&session_id)
            .map(|p| p.cancelled)
            .unwrap_or(false))
    }

    async fn finish(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        if let Some(progress) = self.lock().get_mut(&session_id) {
            progress.status = status;
            progress.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<CrawlProgress>> {
        Ok(self.lock().get(&session_id).cloned())
    }

    async fn delete(&self, session_id: Uuid) -> Result<()> {
        self.lock().remove(&session_id);
        Ok(())
    }
}

/// A progress store that is always unreachable, for degradation tests.
#[derive(Default)]
pub struct FailingProgressStore;

#[async_trait]
impl ProgressStore for FailingProgressStore {
    async fn start(&self, _session_id: Uuid, _domain: &str) -> Result<()> {
        Err(anyhow!("progress store offline"))
    }

    async fn update_progress(
        &self,
        _session_id: Uuid,
        _delta: ProgressDelta,
        _current_url: Option<&str>,
    ) -> Result<()> {
        Err(anyhow!("progress store offline"))
    }

    async fn request_cancel(&self, _session_id: Uuid) -> Result<bool> {
        Err(anyhow!("progress store offline"))
    }

    async fn is_cancelled(&self, _session_id: Uuid) -> Result<bool> {
        Err(anyhow!("progress store offline"))
    }

    async fn finish(&self, _session_id: Uuid, _status: SessionStatus) -> Result<()> {
        Err(anyhow!("progress store offline"))
    }

    async fn get(&self, _session_id: Uuid) -> Result<Option<CrawlProgress>> {
        Err(anyhow!("progress store offline"))
    }

    async fn delete(&self, _session_id: Uuid) -> Result<()> {
        Err(anyhow!("progress store offline"))
    }
}

// ============================================================================
// Fetcher / scorer / indexer doubles
// ============================================================================

/// A canned page served by [`StaticFetcher`].
#[derive(Debug, Clone)]
pub struct StaticPage {
    pub title: Option<String>,
    pub body: String,
    pub links: Vec<String>,
}

/// Serves a fixed URL → page map; unknown URLs return a 404.
///
/// Tracks the high-water mark of concurrent fetches so tests can assert the
/// worker's concurrency bound.
#[derive(Default)]
pub struct StaticFetcher {
    pages: HashMap<String, StaticPage>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Register a page. The URL is normalized the way `Url` prints it, so
    /// `https://example.com` and `https://example.com/` are the same key.
    pub fn add_page(&mut self, url: &str, title: Option<&str>, body: &str, links: &[&str]) {
        let key = Url::parse(url).expect("static page url").to_string();
        self.pages.insert(
            key,
            StaticPage {
                title: title.map(|t| t.to_string()),
                body: body.to_string(),
                links: links.iter().map(|l| l.to_string()).collect(),
            },
        );
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match self.pages.get(url.as_str()) {
            Some(page) => Ok(FetchedPage {
                url: url.clone(),
                title: page.title.clone(),
                description: None,
                body_text: page.body.clone(),
                word_count: page.body.split_whitespace().count(),
                links: page
                    .links
                    .iter()
                    .filter_map(|l| Url::parse(l).ok())
                    .collect(),
            }),
            None => Err(FetchError::Status(404)),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Scores every URL the same; claim order then degrades to creation time.
pub struct FixedScorer(pub i32);

impl PageScorer for FixedScorer {
    fn priority(&self, _url: &Url, _source: &FetchedPage) -> i32 {
        self.0
    }
}

/// Counts apply calls without touching any storage.
#[derive(Default)]
pub struct CountingIndexer {
    pub applied_per_call: usize,
    calls: AtomicUsize,
}

impl CountingIndexer {
    pub fn new(applied_per_call: usize) -> Self {
        Self {
            applied_per_call,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Indexer for CountingIndexer {
    async fn apply_pending(&self, _limit: i64) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.applied_per_call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_claim_orders_by_priority_then_age() {
        let store = MemoryJobStore::new();
        let session = store
            .create_session("example.com", "https://example.com", 3)
            .await
            .unwrap();

        // Drain the root job so only our fixture jobs remain pending.
        let root = store.claim_next(1, None).await.unwrap();
        assert_eq!(root.len(), 1);

        let mut low = CrawlJob::root(&session, "https://example.com/low");
        low.priority = 1;
        let mut high = CrawlJob::root(&session, "https://example.com/high");
        high.priority = 50;
        high.created_at = low.created_at + chrono::Duration::seconds(1);
        store.insert_job(low.clone());
        store.insert_job(high.clone());

        let claimed = store.claim_next(2, None).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, high.id, "higher priority claimed first");
        assert_eq!(claimed[1].id, low.id);
    }

    #[tokio::test]
    async fn test_memory_claim_respects_domain_filter() {
        let store = MemoryJobStore::new();
        store
            .create_session("a.com", "https://a.com", 1)
            .await
            .unwrap();
        store
            .create_session("b.com", "https://b.com", 1)
            .await
            .unwrap();

        let claimed = store.claim_next(10, Some("a.com")).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].domain, "a.com");
    }

    #[tokio::test]
    async fn test_static_fetcher_404_for_unknown() {
        let fetcher = StaticFetcher::new();
        let err = fetcher
            .fetch(&Url::parse("https://example.com/missing").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
    }
}
