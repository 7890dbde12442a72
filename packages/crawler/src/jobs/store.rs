//! PostgreSQL-backed job store.
//!
//! The job store is the single source of truth for crawl state. Everything
//! that must be visible together — a terminal status transition, the session
//! counters it implies, and the child jobs it spawns — commits as one
//! transaction before any caller can observe it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::model::{
    ChildLink, CrawlJob, CrawlSession, PageOutcome, QueueDepth, SessionJobCounts, Site,
};

/// Storage and retrieval of crawl sessions, jobs and registered sites.
///
/// Implementations must make `claim_next` atomic: no two concurrent callers
/// may ever observe the same job as claimed.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a session and its depth-0 root job in one unit.
    async fn create_session(
        &self,
        domain: &str,
        root_url: &str,
        max_depth: i32,
    ) -> Result<CrawlSession>;

    /// Atomically claim up to `limit` pending jobs, ordered by priority
    /// (descending) then creation time (older wins), transitioning each to
    /// `processing`.
    async fn claim_next(&self, limit: i64, domain: Option<&str>) -> Result<Vec<CrawlJob>>;

    /// Idempotent terminal transition to `completed`. Returns false when the
    /// job was already terminal (still a success).
    async fn complete(&self, job_id: Uuid) -> Result<bool>;

    /// Idempotent terminal transition to `failed`, bumping the session's
    /// failure counter and closing the session if drained.
    async fn fail(&self, job_id: Uuid, reason: &str) -> Result<bool>;

    /// The single committed unit of a successful crawl: job → `completed`
    /// with its extracted content, session counter bump, child inserts
    /// (deduplicated per session/url), session close-if-drained. Returns the
    /// number of children actually inserted.
    async fn finish_job(
        &self,
        job: &CrawlJob,
        outcome: &PageOutcome,
        children: &[ChildLink],
    ) -> Result<u64>;

    /// Insert pending child jobs one hop below `parent`, skipping URLs the
    /// session already has. The worker enqueues children through
    /// `finish_job`; this standalone form serves operator tooling (e.g.
    /// seeding extra URLs into a live session). Returns how many were
    /// inserted.
    async fn enqueue_children(&self, parent: &CrawlJob, children: &[ChildLink]) -> Result<u64>;

    async fn count_by_status(&self, session_id: Uuid) -> Result<SessionJobCounts>;

    async fn session(&self, session_id: Uuid) -> Result<Option<CrawlSession>>;

    /// Durable side of cancellation. Returns false when the session was not
    /// running (already terminal or unknown) — the call is idempotent.
    async fn cancel_session(&self, session_id: Uuid) -> Result<bool>;

    async fn active_session_for_domain(&self, domain: &str) -> Result<Option<CrawlSession>>;

    async fn last_session_for_domain(&self, domain: &str) -> Result<Option<CrawlSession>>;

    async fn queue_depth(&self) -> Result<QueueDepth>;

    async fn list_sites(&self) -> Result<Vec<Site>>;

    async fn register_site(&self, domain: &str) -> Result<Site>;

    async fn set_next_crawl_at(&self, domain: &str, at: Option<DateTime<Utc>>) -> Result<()>;
}

const JOB_COLUMNS: &str = "id, session_id, domain, url, status, priority, depth, max_depth, \
     error_message, title, description, word_count, indexed, \
     created_at, updated_at, started_at, completed_at";

const SESSION_COLUMNS: &str = "id, domain, status, max_depth, pages_crawled, pages_failed, \
     created_at, started_at, ended_at, cancelled_at";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &CrawlJob) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO crawl_jobs (
                id, session_id, domain, url, status, priority, depth, max_depth,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            ON CONFLICT (session_id, url) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.session_id)
        .bind(&job.domain)
        .bind(&job.url)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.depth)
        .bind(job.max_depth)
        .execute(&mut **tx)
        .await
        .context("Failed to insert crawl job")?;

        Ok(result.rows_affected())
    }

    /// When no pending or processing jobs remain, close a still-running
    /// session: `completed` if anything completed, `failed` otherwise.
    /// `ended_at` is written at most once.
    async fn close_session_if_drained(
        tx: &mut Transaction<'_, Postgres>,
        session_id: Uuid,
    ) -> Result<()> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed
            FROM crawl_jobs
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to count session jobs")?;

        let pending: i64 = row.get("pending");
        let processing: i64 = row.get("processing");
        let completed: i64 = row.get("completed");

        if pending + processing > 0 {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE crawl_sessions
            SET status = CASE WHEN $2 THEN 'completed'::crawl_session_status
                              ELSE 'failed'::crawl_session_status END,
                ended_at = COALESCE(ended_at, NOW())
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(session_id)
        .bind(completed > 0)
        .execute(&mut **tx)
        .await
        .context("Failed to close crawl session")?;

        if result.rows_affected() > 0 {
            debug!(session_id = %session_id, completed, "crawl session closed");
        }

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_session(
        &self,
        domain: &str,
        root_url: &str,
        max_depth: i32,
    ) -> Result<CrawlSession> {
        let session = CrawlSession::new(domain, max_depth);
        let root = CrawlJob::root(&session, root_url);

        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        sqlx::query(
            r#"
            INSERT INTO crawl_sessions (
                id, domain, status, max_depth, pages_crawled, pages_failed,
                created_at, started_at
            ) VALUES ($1, $2, $3, $4, 0, 0, NOW(), NOW())
            "#,
        )
        .bind(session.id)
        .bind(&session.domain)
        .bind(session.status)
        .bind(session.max_depth)
        .execute(&mut *tx)
        .await
        .context("Failed to insert crawl session")?;

        Self::insert_job(&mut tx, &root).await?;

        tx.commit().await.context("Failed to commit session creation")?;

        Ok(session)
    }

    async fn claim_next(&self, limit: i64, domain: Option<&str>) -> Result<Vec<CrawlJob>> {
        // FOR UPDATE SKIP LOCKED makes concurrent claims mutually exclusive:
        // a row selected by one claimer is invisible to the others.
        let jobs = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM crawl_jobs
                WHERE status = 'pending'
                  AND ($2::text IS NULL OR domain = $2)
                ORDER BY priority DESC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE crawl_jobs
            SET status = 'processing',
                started_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim jobs")?;

        Ok(jobs)
    }

    async fn complete(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'completed',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to complete job")?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail(&self, job_id: Uuid, reason: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        let row = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'failed',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING session_id
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to fail job")?;

        let Some(row) = row else {
            // Already terminal: tolerate at-least-once signaling.
            tx.commit().await?;
            return Ok(false);
        };
        let session_id: Uuid = row.get("session_id");

        sqlx::query("UPDATE crawl_sessions SET pages_failed = pages_failed + 1 WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .context("Failed to bump session failure counter")?;

        Self::close_session_if_drained(&mut tx, session_id).await?;

        tx.commit().await.context("Failed to commit job failure")?;

        Ok(true)
    }

    async fn finish_job(
        &self,
        job: &CrawlJob,
        outcome: &PageOutcome,
        children: &[ChildLink],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'completed',
                title = $2,
                description = $3,
                word_count = $4,
                indexed = FALSE,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(job.id)
        .bind(&outcome.title)
        .bind(&outcome.description)
        .bind(outcome.word_count)
        .execute(&mut *tx)
        .await
        .context("Failed to complete job")?;

        if result.rows_affected() == 0 {
            // Already terminal; do not double-count or re-enqueue children.
            tx.commit().await?;
            return Ok(0);
        }

        sqlx::query("UPDATE crawl_sessions SET pages_crawled = pages_crawled + 1 WHERE id = $1")
            .bind(job.session_id)
            .execute(&mut *tx)
            .await
            .context("Failed to bump session crawl counter")?;

        let mut inserted = 0;
        if job.can_expand() {
            for link in children {
                let child = job.child(&link.url, link.priority);
                inserted += Self::insert_job(&mut tx, &child).await?;
            }
        }

        Self::close_session_if_drained(&mut tx, job.session_id).await?;

        tx.commit().await.context("Failed to commit job completion")?;

        debug!(
            job_id = %job.id,
            children = inserted,
            "job completed"
        );

        Ok(inserted)
    }

    async fn enqueue_children(&self, parent: &CrawlJob, children: &[ChildLink]) -> Result<u64> {
        if !parent.can_expand() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        let mut inserted = 0;
        for link in children {
            let child = parent.child(&link.url, link.priority);
            inserted += Self::insert_job(&mut tx, &child).await?;
        }

        tx.commit().await.context("Failed to commit child jobs")?;
        Ok(inserted)
    }

    async fn count_by_status(&self, session_id: Uuid) -> Result<SessionJobCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM crawl_jobs
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count session jobs")?;

        Ok(SessionJobCounts {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }

    async fn session(&self, session_id: Uuid) -> Result<Option<CrawlSession>> {
        let session = sqlx::query_as::<_, CrawlSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM crawl_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session")?;

        Ok(session)
    }

    async fn cancel_session(&self, session_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_sessions
            SET status = 'cancelled',
                cancelled_at = NOW(),
                ended_at = COALESCE(ended_at, NOW())
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to cancel session")?;

        Ok(result.rows_affected() > 0)
    }

    async fn active_session_for_domain(&self, domain: &str) -> Result<Option<CrawlSession>> {
        let session = sqlx::query_as::<_, CrawlSession>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM crawl_sessions
            WHERE domain = $1 AND status = 'running'
            ORDER BY started_at DESC
            LIMIT 1
            "#
        ))
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch active session")?;

        Ok(session)
    }

    async fn last_session_for_domain(&self, domain: &str) -> Result<Option<CrawlSession>> {
        let session = sqlx::query_as::<_, CrawlSession>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM crawl_sessions
            WHERE domain = $1
            ORDER BY started_at DESC
            LIMIT 1
            "#
        ))
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch last session")?;

        Ok(session)
    }

    async fn queue_depth(&self) -> Result<QueueDepth> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing
            FROM crawl_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to measure queue depth")?;

        Ok(QueueDepth {
            pending: row.get("pending"),
            processing: row.get("processing"),
        })
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        let sites = sqlx::query_as::<_, Site>(
            "SELECT id, domain, enabled, next_crawl_at, created_at FROM sites ORDER BY domain",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sites")?;

        Ok(sites)
    }

    async fn register_site(&self, domain: &str) -> Result<Site> {
        let site = sqlx::query_as::<_, Site>(
            r#"
            INSERT INTO sites (id, domain, enabled, created_at)
            VALUES ($1, $2, TRUE, NOW())
            ON CONFLICT (domain) DO UPDATE SET domain = EXCLUDED.domain
            RETURNING id, domain, enabled, next_crawl_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(domain)
        .fetch_one(&self.pool)
        .await
        .context("Failed to register site")?;

        Ok(site)
    }

    async fn set_next_crawl_at(&self, domain: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE sites SET next_crawl_at = $2 WHERE domain = $1")
            .bind(domain)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("Failed to update site schedule")?;

        Ok(())
    }
}
