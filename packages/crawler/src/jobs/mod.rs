//! Durable crawl job state: models and the job store.

pub mod model;
pub mod store;

pub use model::{
    ChildLink, CrawlJob, CrawlSession, JobStatus, PageOutcome, QueueDepth, SessionJobCounts,
    SessionStatus, Site, ROOT_PRIORITY,
};
pub use store::{JobStore, PostgresJobStore};
