//! Live crawl progress records.
//!
//! These are ephemeral and TTL-bounded: the durable store answers "did this
//! job run", the progress record only answers "is this crawl still wanted
//! and what is it doing right now". The two are deliberately never part of
//! one transactional boundary.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::SessionStatus;

/// Snapshot of a session's live progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub session_id: Uuid,
    pub domain: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub pages_crawled: u64,
    pub pages_failed: u64,
    pub pages_skipped: u64,
    pub current_url: Option<String>,
    /// Monotonic: once true, only `delete` plus a fresh `start` clears it.
    pub cancelled: bool,
    pub last_updated: DateTime<Utc>,
}

impl CrawlProgress {
    pub fn new(session_id: Uuid, domain: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            domain: domain.to_string(),
            status: SessionStatus::Running,
            started_at: now,
            ended_at: None,
            cancelled_at: None,
            pages_crawled: 0,
            pages_failed: 0,
            pages_skipped: 0,
            current_url: None,
            cancelled: false,
            last_updated: now,
        }
    }

    /// Merge a delta and stamp `last_updated`.
    pub fn apply(&mut self, delta: ProgressDelta, current_url: Option<&str>) {
        self.pages_crawled += delta.pages_crawled;
        self.pages_failed += delta.pages_failed;
        self.pages_skipped += delta.pages_skipped;
        if let Some(url) = current_url {
            self.current_url = Some(url.to_string());
        }
        self.last_updated = Utc::now();
    }
}

/// Counter increments reported after each processed page.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressDelta {
    pub pages_crawled: u64,
    pub pages_failed: u64,
    pub pages_skipped: u64,
}

impl ProgressDelta {
    pub fn crawled() -> Self {
        Self {
            pages_crawled: 1,
            ..Self::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            pages_failed: 1,
            ..Self::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            pages_skipped: 1,
            ..Self::default()
        }
    }
}

/// Ephemeral per-session progress and cancellation state.
///
/// If an implementation is unreachable, cancellation becomes unavailable but
/// crawling must continue: callers treat every error as a degraded no-op,
/// never as a reason to stop work.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Create a fresh record (`running`, zeroed counters, full TTL).
    async fn start(&self, session_id: Uuid, domain: &str) -> Result<()>;

    /// Merge counters, optionally set the current URL, refresh the TTL.
    /// A missing (expired) record is a silent no-op.
    async fn update_progress(
        &self,
        session_id: Uuid,
        delta: ProgressDelta,
        current_url: Option<&str>,
    ) -> Result<()>;

    /// Set the cancellation flag. Returns false when no record exists.
    async fn request_cancel(&self, session_id: Uuid) -> Result<bool>;

    /// Hot-path read, called per page and per batch by the worker.
    async fn is_cancelled(&self, session_id: Uuid) -> Result<bool>;

    /// Stamp the terminal status; the record then ages out via its TTL.
    async fn finish(&self, session_id: Uuid, status: SessionStatus) -> Result<()>;

    async fn get(&self, session_id: Uuid) -> Result<Option<CrawlProgress>>;

    async fn delete(&self, session_id: Uuid) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_merges_counters() {
        let mut progress = CrawlProgress::new(Uuid::new_v4(), "example.com");
        progress.apply(ProgressDelta::crawled(), Some("https://example.com/a"));
        progress.apply(ProgressDelta::failed(), None);
        progress.apply(ProgressDelta::skipped(), None);

        assert_eq!(progress.pages_crawled, 1);
        assert_eq!(progress.pages_failed, 1);
        assert_eq!(progress.pages_skipped, 1);
        // A delta without a URL keeps the previous one.
        assert_eq!(progress.current_url.as_deref(), Some("https://example.com/a"));
    }

    #[test]
    fn test_new_record_is_not_cancelled() {
        let progress = CrawlProgress::new(Uuid::new_v4(), "example.com");
        assert!(!progress.cancelled);
        assert_eq!(progress.status, SessionStatus::Running);
        assert!(progress.ended_at.is_none());
    }
}
