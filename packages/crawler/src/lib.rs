//! Crawl scheduling and worker orchestration.
//!
//! The job store (Postgres) is the single source of truth for crawl state;
//! the progress store (Redis) holds the ephemeral, TTL-bounded live view and
//! the cooperative cancellation flag. A bounded-concurrency worker claims
//! and executes jobs; a background scheduler starts jittered crawl campaigns
//! across the registered site fleet and drives the indexing-apply stage.

pub mod config;
pub mod controls;
pub mod indexer;
pub mod jobs;
pub mod scheduler;
pub mod state;
pub mod testing;
pub mod worker;

pub use config::Config;
pub use controls::{Controls, ControlsStatus};
pub use indexer::{Indexer, SqlIndexer};
pub use jobs::{CrawlJob, CrawlSession, JobStatus, JobStore, PostgresJobStore, SessionStatus};
pub use scheduler::{BackgroundScheduler, SchedulerConfig};
pub use state::{ProgressStore, RedisProgressStore};
pub use worker::{CrawlWorker, WorkerConfig};
