//! Redis-backed progress store.
//!
//! One JSON value per session under `crawler:{session_id}`, written with
//! `SET ... EX` so every update refreshes the TTL — a live crawl never
//! expires mid-flight, an idle record ages out on its own.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::progress::{CrawlProgress, ProgressDelta, ProgressStore};
use crate::jobs::SessionStatus;

const KEY_PREFIX: &str = "crawler:";

/// Default record lifetime: one hour, refreshed on every write.
pub const PROGRESS_TTL_SECS: u64 = 3600;

pub struct RedisProgressStore {
    client: redis::Client,
    /// Lazily established, shared connection. Cleared on error so the next
    /// call reconnects instead of reusing a dead socket.
    conn: Mutex<Option<MultiplexedConnection>>,
    ttl_secs: u64,
}

impl RedisProgressStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            ttl_secs: PROGRESS_TTL_SECS,
        })
    }

    pub fn with_ttl(redis_url: &str, ttl_secs: u64) -> Result<Self> {
        let mut store = Self::new(redis_url)?;
        store.ttl_secs = ttl_secs;
        Ok(store)
    }

    fn key(session_id: Uuid) -> String {
        format!("{KEY_PREFIX}{session_id}")
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_conn(&self) {
        *self.conn.lock().await = None;
    }

    async fn read(&self, session_id: Uuid) -> Result<Option<CrawlProgress>> {
        let mut conn = self.conn().await?;
        let raw: redis::RedisResult<Option<String>> = conn.get(Self::key(session_id)).await;
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                self.drop_conn().await;
                return Err(e).context("Failed to read progress record");
            }
        };
        match raw {
            Some(json) => {
                let progress = serde_json::from_str(&json)
                    .context("Failed to decode progress record")?;
                Ok(Some(progress))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, progress: &CrawlProgress) -> Result<()> {
        let json = serde_json::to_string(progress).context("Failed to encode progress record")?;
        let mut conn = self.conn().await?;
        let result: redis::RedisResult<()> = conn
            .set_ex(Self::key(progress.session_id), json, self.ttl_secs)
            .await;
        if let Err(e) = result {
            self.drop_conn().await;
            return Err(e).context("Failed to write progress record");
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn start(&self, session_id: Uuid, domain: &str) -> Result<()> {
        self.write(&CrawlProgress::new(session_id, domain)).await
    }

    async fn update_progress(
        &self,
        session_id: Uuid,
        delta: ProgressDelta,
        current_url: Option<&str>,
    ) -> Result<()> {
        let Some(mut progress) = self.read(session_id).await? else {
            // Record expired while the crawl was idle; nothing to merge into.
            return Ok(());
        };
        progress.apply(delta, current_url);
        self.write(&progress).await
    }

    async fn request_cancel(&self, session_id: Uuid) -> Result<bool> {
        let Some(mut progress) = self.read(session_id).await? else {
            return Ok(false);
        };
        progress.cancelled = true;
        progress.cancelled_at = Some(Utc::now());
        progress.status = SessionStatus::Cancelled;
        self.write(&progress).await?;
        Ok(true)
    }

    async fn is_cancelled(&self, session_id: Uuid) -> Result<bool> {
        Ok(self
            .read(session_id)
            .await?
            .map(|p| p.cancelled)
            .unwrap_or(false))
    }

    async fn finish(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        let Some(mut progress) = self.read(session_id).await? else {
            return Ok(());
        };
        progress.status = status;
        progress.ended_at = Some(Utc::now());
        progress.last_updated = Utc::now();
        self.write(&progress).await
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<CrawlProgress>> {
        self.read(session_id).await
    }

    async fn delete(&self, session_id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let result: redis::RedisResult<()> = conn.del(Self::key(session_id)).await;
        if let Err(e) = result {
            self.drop_conn().await;
            return Err(e).context("Failed to delete progress record");
        }
        Ok(())
    }
}
