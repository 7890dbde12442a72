//! Background scheduler tests: discovery gating, jitter, drain, admin ops.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crawler_core::controls::Controls;
use crawler_core::jobs::{CrawlSession, JobStatus, JobStore, SessionStatus};
use crawler_core::scheduler::{BackgroundScheduler, SchedulerConfig};
use crawler_core::state::ProgressStore;
use crawler_core::testing::{CountingIndexer, MemoryJobStore, MemoryProgressStore};

// =============================================================================
// Test helpers
// =============================================================================

struct Harness {
    store: Arc<MemoryJobStore>,
    progress: Arc<MemoryProgressStore>,
    indexer: Arc<CountingIndexer>,
    controls: Arc<Controls>,
    scheduler: BackgroundScheduler,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let progress = Arc::new(MemoryProgressStore::new());
    let indexer = Arc::new(CountingIndexer::new(7));
    let controls = Arc::new(Controls::new(4, 24));
    let scheduler = BackgroundScheduler::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::clone(&progress) as Arc<dyn ProgressStore>,
        Arc::clone(&indexer) as Arc<dyn crawler_core::indexer::Indexer>,
        Arc::clone(&controls),
        SchedulerConfig::default(),
    );
    Harness {
        store,
        progress,
        indexer,
        controls,
        scheduler,
    }
}

/// Insert a finished session whose crawl started `hours_ago`.
fn seed_session(store: &MemoryJobStore, domain: &str, hours_ago: i64, status: SessionStatus) {
    let mut session = CrawlSession::new(domain, 3);
    session.started_at = Utc::now() - Duration::hours(hours_ago);
    session.status = status;
    if status != SessionStatus::Running {
        session.ended_at = Some(session.started_at + Duration::minutes(30));
    }
    store.insert_session(session);
}

// =============================================================================
// Discovery
// =============================================================================

#[tokio::test]
async fn test_discovery_skips_recently_crawled_domain() {
    let h = harness();
    h.store.insert_site("recent.com", true, None);
    seed_session(&h.store, "recent.com", 2, SessionStatus::Completed);

    let report = h.scheduler.discover_and_schedule().await.unwrap();
    assert_eq!(report.skipped_recent, 1);
    assert_eq!(report.scheduled, 0);
    assert!(h
        .store
        .active_session_for_domain("recent.com")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_discovery_schedules_overdue_and_never_crawled() {
    let h = harness();
    h.store.insert_site("old.com", true, None);
    seed_session(&h.store, "old.com", 30, SessionStatus::Completed);
    h.store.insert_site("fresh.com", true, None);

    let report = h.scheduler.discover_and_schedule().await.unwrap();
    assert_eq!(report.scheduled, 2);

    for domain in ["old.com", "fresh.com"] {
        let session = h
            .store
            .active_session_for_domain(domain)
            .await
            .unwrap()
            .expect("session started");
        assert_eq!(session.max_depth, 3);

        let jobs = h.store.jobs_for_session(session.id);
        assert_eq!(jobs.len(), 1, "one depth-0 root job");
        assert_eq!(jobs[0].depth, 0);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].url, format!("https://{domain}"));
    }
}

#[tokio::test]
async fn test_discovery_skips_domains_with_active_session() {
    let h = harness();
    h.store.insert_site("busy.com", true, None);
    seed_session(&h.store, "busy.com", 30, SessionStatus::Running);

    let report = h.scheduler.discover_and_schedule().await.unwrap();
    assert_eq!(report.skipped_active, 1);
    assert_eq!(report.scheduled, 0);

    // Still exactly one session: no duplicate concurrent crawl.
    assert_eq!(
        h.store
            .last_session_for_domain("busy.com")
            .await
            .unwrap()
            .unwrap()
            .status,
        SessionStatus::Running
    );
}

#[tokio::test]
async fn test_discovery_defers_with_jitter_inside_window() {
    let h = harness();
    h.store.insert_site("mid.com", true, None);
    seed_session(&h.store, "mid.com", 10, SessionStatus::Completed);

    let before = Utc::now();
    let report = h.scheduler.discover_and_schedule().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.scheduled, 0);

    let site = h.store.site("mid.com").unwrap();
    let at = site.next_crawl_at.expect("jittered next crawl time drawn");
    assert!(at >= before + Duration::hours(4));
    assert!(at <= Utc::now() + Duration::hours(24));
}

#[tokio::test]
async fn test_discovery_honours_due_next_crawl_time() {
    let h = harness();
    h.store
        .insert_site("due.com", true, Some(Utc::now() - Duration::minutes(1)));
    seed_session(&h.store, "due.com", 10, SessionStatus::Completed);

    let report = h.scheduler.discover_and_schedule().await.unwrap();
    assert_eq!(report.scheduled, 1);

    // The schedule slot is consumed when the session starts.
    assert!(h.store.site("due.com").unwrap().next_crawl_at.is_none());
}

#[tokio::test]
async fn test_discovery_leaves_future_schedule_alone() {
    let h = harness();
    let future = Utc::now() + Duration::hours(8);
    h.store.insert_site("later.com", true, Some(future));
    seed_session(&h.store, "later.com", 10, SessionStatus::Completed);

    let report = h.scheduler.discover_and_schedule().await.unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(h.store.site("later.com").unwrap().next_crawl_at, Some(future));
}

#[tokio::test]
async fn test_discovery_skips_disabled_sites() {
    let h = harness();
    h.store.insert_site("off.com", false, None);

    let report = h.scheduler.discover_and_schedule().await.unwrap();
    assert_eq!(report.skipped_disabled, 1);
    assert_eq!(report.scheduled, 0);
}

// =============================================================================
// Rescheduling
// =============================================================================

#[tokio::test]
async fn test_reschedule_random_redraws_idle_sites_only() {
    let h = harness();
    h.store.insert_site("idle.com", true, None);
    seed_session(&h.store, "idle.com", 10, SessionStatus::Completed);
    h.store.insert_site("busy.com", true, None);
    seed_session(&h.store, "busy.com", 1, SessionStatus::Running);

    let before = Utc::now();
    let rescheduled = h.scheduler.reschedule_random().await.unwrap();
    assert_eq!(rescheduled, 1);

    let at = h
        .store
        .site("idle.com")
        .unwrap()
        .next_crawl_at
        .expect("idle site redrawn");
    assert!(at >= before + Duration::hours(4));
    assert!(at <= Utc::now() + Duration::hours(24));

    assert!(h.store.site("busy.com").unwrap().next_crawl_at.is_none());
}

// =============================================================================
// Drain / indexing gate
// =============================================================================

#[tokio::test]
async fn test_drain_applies_index_unless_paused() {
    let h = harness();

    let report = h.scheduler.drain_queue().await.unwrap();
    assert_eq!(report.indexed, 7);
    assert_eq!(h.indexer.calls(), 1);

    // Pause indexing: crawling state is untouched, applying stops.
    let status = h.scheduler.pause_indexing();
    assert!(status.force_pause_index);
    assert!(status.crawl_enabled);

    let report = h.scheduler.drain_queue().await.unwrap();
    assert_eq!(report.indexed, 0);
    assert_eq!(h.indexer.calls(), 1, "indexer not invoked while paused");

    let status = h.scheduler.resume_all();
    assert!(status.index_enabled);

    let report = h.scheduler.drain_queue().await.unwrap();
    assert_eq!(report.indexed, 7);
    assert_eq!(h.indexer.calls(), 2);
}

#[tokio::test]
async fn test_drain_reports_queue_depth() {
    let h = harness();
    let session = h
        .store
        .create_session("example.com", "https://example.com/", 3)
        .await
        .unwrap();
    let _ = session;

    let report = h.scheduler.drain_queue().await.unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.processing, 0);
}

// =============================================================================
// Administrative operations
// =============================================================================

#[tokio::test]
async fn test_cancel_session_flags_both_stores() {
    let h = harness();
    let session = h.scheduler.start_crawl("example.com").await.unwrap();

    assert!(h.scheduler.cancel_session(session.id).await.unwrap());

    let snapshot = h.store.session_snapshot(session.id).unwrap();
    assert_eq!(snapshot.status, SessionStatus::Cancelled);
    assert!(snapshot.cancelled_at.is_some());
    let first_ended_at = snapshot.ended_at.expect("ended_at set on cancellation");

    let record = h.progress.get(session.id).await.unwrap().unwrap();
    assert!(record.cancelled);
    assert_eq!(record.status, SessionStatus::Cancelled);

    // Second cancel: idempotent, ended_at untouched.
    assert!(!h.scheduler.cancel_session(session.id).await.unwrap());
    let snapshot = h.store.session_snapshot(session.id).unwrap();
    assert_eq!(snapshot.ended_at, Some(first_ended_at));
}

#[tokio::test]
async fn test_purge_session_state_removes_progress_record() {
    let h = harness();
    let session = h.scheduler.start_crawl("example.com").await.unwrap();
    assert!(h.progress.get(session.id).await.unwrap().is_some());

    h.scheduler.purge_session_state(session.id).await.unwrap();
    assert!(h.progress.get(session.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_session_stats_combines_durable_and_live_views() {
    let h = harness();
    let session = h.scheduler.start_crawl("example.com").await.unwrap();

    let stats = h
        .scheduler
        .session_stats(session.id)
        .await
        .unwrap()
        .expect("session exists");
    assert_eq!(stats.session.id, session.id);
    assert_eq!(stats.jobs.pending, 1);
    assert!(stats.progress.is_some());

    let missing = h
        .scheduler
        .session_stats(uuid::Uuid::new_v4())
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_force_stop_and_resume_status() {
    let h = harness();

    let status = h.scheduler.force_stop_all();
    assert!(status.force_stop);
    assert!(!status.crawl_enabled);
    assert!(!h.controls.crawl_allowed());

    let status = h.scheduler.resume_all();
    assert!(!status.force_stop);
    assert!(status.crawl_enabled);
    assert!(h.controls.crawl_allowed());

    let status = h.scheduler.status();
    assert_eq!(status.min_interval_hours, 4);
    assert_eq!(status.max_interval_hours, 24);
}

#[tokio::test]
async fn test_register_site_is_idempotent() {
    let h = harness();
    let first = h.store.register_site("example.com").await.unwrap();
    let second = h.store.register_site("example.com").await.unwrap();
    assert_eq!(first.id, second.id);
    assert!(second.enabled);

    let sites = h.store.list_sites().await.unwrap();
    assert_eq!(sites.len(), 1);
}

#[tokio::test]
async fn test_start_crawl_creates_progress_record() {
    let h = harness();
    let session = h.scheduler.start_crawl("example.com").await.unwrap();

    let record = h.progress.get(session.id).await.unwrap().unwrap();
    assert_eq!(record.domain, "example.com");
    assert!(!record.cancelled);
    assert_eq!(record.pages_crawled, 0);
}
