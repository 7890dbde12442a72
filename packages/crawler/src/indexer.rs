//! Indexing-apply stage: copies completed crawl results into the
//! search-documents table consumed by the query pipeline.
//!
//! Gating by the global controls happens at the call site (the scheduler's
//! drain tick), so implementations stay policy-free.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

/// Applies completed, not-yet-indexed crawl jobs to the search index.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Apply up to `limit` pending results; returns how many were applied.
    async fn apply_pending(&self, limit: i64) -> Result<usize>;
}

pub struct SqlIndexer {
    pool: PgPool,
}

impl SqlIndexer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Indexer for SqlIndexer {
    async fn apply_pending(&self, limit: i64) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        // SKIP LOCKED keeps a concurrent apply (or a manual drain trigger)
        // from double-indexing the same rows.
        let rows = sqlx::query(
            r#"
            SELECT id, url, domain, title, description, word_count
            FROM crawl_jobs
            WHERE status = 'completed' AND indexed = FALSE AND title IS NOT NULL
            ORDER BY completed_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to select unindexed jobs")?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut applied: Vec<Uuid> = Vec::with_capacity(rows.len());
        for row in &rows {
            let job_id: Uuid = row.get("id");
            sqlx::query(
                r#"
                INSERT INTO search_documents (
                    id, url, domain, title, description, word_count, indexed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (url) DO UPDATE
                SET title = EXCLUDED.title,
                    description = EXCLUDED.description,
                    word_count = EXCLUDED.word_count,
                    indexed_at = NOW()
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(row.get::<String, _>("url"))
            .bind(row.get::<String, _>("domain"))
            .bind(row.get::<String, _>("title"))
            .bind(row.get::<Option<String>, _>("description"))
            .bind(row.get::<i32, _>("word_count"))
            .execute(&mut *tx)
            .await
            .context("Failed to upsert search document")?;
            applied.push(job_id);
        }

        sqlx::query("UPDATE crawl_jobs SET indexed = TRUE, updated_at = NOW() WHERE id = ANY($1)")
            .bind(&applied)
            .execute(&mut *tx)
            .await
            .context("Failed to mark jobs as indexed")?;

        tx.commit().await.context("Failed to commit index apply")?;

        debug!(applied = applied.len(), "applied crawl results to index");
        Ok(applied.len())
    }
}
