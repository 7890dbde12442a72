//! Ephemeral, TTL-bounded crawl state (progress + cancellation).

pub mod progress;
pub mod redis;

pub use self::progress::{CrawlProgress, ProgressDelta, ProgressStore};
pub use self::redis::{RedisProgressStore, PROGRESS_TTL_SECS};
