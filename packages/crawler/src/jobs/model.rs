//! Durable crawl models: sessions, jobs and the registered site fleet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Priority assigned to the depth-0 root job of a session.
pub const ROOT_PRIORITY: i32 = 100;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "crawl_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "crawl_session_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    Completed,
    Cancelled,
    Failed,
}

// ============================================================================
// Models
// ============================================================================

/// One top-level crawl campaign for a domain.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct CrawlSession {
    pub id: Uuid,
    pub domain: String,
    pub status: SessionStatus,
    pub max_depth: i32,
    pub pages_crawled: i32,
    pub pages_failed: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Set exactly once, on the first transition out of `running`.
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl CrawlSession {
    pub fn new(domain: &str, max_depth: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            status: SessionStatus::Running,
            max_depth,
            pages_crawled: 0,
            pages_failed: 0,
            created_at: now,
            started_at: now,
            ended_at: None,
            cancelled_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

/// One unit of work: fetch one URL at one depth.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct CrawlJob {
    pub id: Uuid,
    pub session_id: Uuid,
    pub domain: String,
    pub url: String,
    pub status: JobStatus,
    /// Higher priority is claimed sooner; older jobs win ties.
    pub priority: i32,
    pub depth: i32,
    pub max_depth: i32,
    pub error_message: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub word_count: i32,
    /// False until the indexing stage has applied this job's result.
    pub indexed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CrawlJob {
    /// The depth-0 root job of a session.
    pub fn root(session: &CrawlSession, url: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id: session.id,
            domain: session.domain.clone(),
            url: url.to_string(),
            status: JobStatus::Pending,
            priority: ROOT_PRIORITY,
            depth: 0,
            max_depth: session.max_depth,
            error_message: None,
            title: None,
            description: None,
            word_count: 0,
            indexed: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// A child job one hop below `self`. Callers must check [`can_expand`]
    /// first; depth never exceeds `max_depth`.
    ///
    /// [`can_expand`]: CrawlJob::can_expand
    pub fn child(&self, url: &str, priority: i32) -> Self {
        debug_assert!(self.can_expand());
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            domain: self.domain.clone(),
            url: url.to_string(),
            status: JobStatus::Pending,
            priority,
            depth: self.depth + 1,
            max_depth: self.max_depth,
            error_message: None,
            title: None,
            description: None,
            word_count: 0,
            indexed: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether links found on this page may become new jobs.
    pub fn can_expand(&self) -> bool {
        self.depth + 1 <= self.max_depth
    }
}

/// A registered domain the scheduler crawls autonomously.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Site {
    pub id: Uuid,
    pub domain: String,
    pub enabled: bool,
    /// Next jittered crawl time; cleared when a session starts.
    pub next_crawl_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Reports
// ============================================================================

/// Per-session job counts, grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionJobCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl SessionJobCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// No more work will arrive for this session on its own.
    pub fn drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Global queue depth across all sessions.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueDepth {
    pub pending: i64,
    pub processing: i64,
}

/// What a completed fetch contributes to the job row.
#[derive(Debug, Clone, Default)]
pub struct PageOutcome {
    pub title: Option<String>,
    pub description: Option<String>,
    pub word_count: i32,
}

/// A discovered link to enqueue as a child job.
#[derive(Debug, Clone)]
pub struct ChildLink {
    pub url: String,
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_job_starts_at_depth_zero() {
        let session = CrawlSession::new("example.com", 3);
        let job = CrawlJob::root(&session, "https://example.com");
        assert_eq!(job.depth, 0);
        assert_eq!(job.max_depth, 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, ROOT_PRIORITY);
    }

    #[test]
    fn test_child_depth_increments() {
        let session = CrawlSession::new("example.com", 2);
        let root = CrawlJob::root(&session, "https://example.com");
        let child = root.child("https://example.com/about", 50);
        assert_eq!(child.depth, 1);
        assert_eq!(child.max_depth, 2);
        assert_eq!(child.session_id, root.session_id);
    }

    #[test]
    fn test_can_expand_respects_max_depth() {
        let session = CrawlSession::new("example.com", 1);
        let root = CrawlJob::root(&session, "https://example.com");
        assert!(root.can_expand());
        let child = root.child("https://example.com/a", 10);
        assert!(!child.can_expand());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_session_counts_drained() {
        let counts = SessionJobCounts {
            pending: 0,
            processing: 0,
            completed: 4,
            failed: 1,
        };
        assert!(counts.drained());
        assert_eq!(counts.total(), 5);
    }
}
