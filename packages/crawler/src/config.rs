use std::time::Duration;

use anyhow::{ensure, Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::scheduler::SchedulerConfig;
use crate::worker::WorkerConfig;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub user_agent: String,
    pub max_concurrent_jobs: usize,
    pub poll_interval_secs: u64,
    pub min_crawl_interval_hours: u32,
    pub max_crawl_interval_hours: u32,
    pub default_max_depth: i32,
    pub request_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            user_agent: env::var("CRAWLER_UA")
                .unwrap_or_else(|_| "LumenCrawler/0.1 (+https://lumensearch.dev/bot)".to_string()),
            max_concurrent_jobs: parse_var("MAX_CONCURRENT_JOBS", 3)?,
            poll_interval_secs: parse_var("POLL_INTERVAL_SECS", 5)?,
            min_crawl_interval_hours: parse_var("MIN_CRAWL_INTERVAL_HOURS", 4)?,
            max_crawl_interval_hours: parse_var("MAX_CRAWL_INTERVAL_HOURS", 24)?,
            default_max_depth: parse_var("DEFAULT_MAX_DEPTH", 3)?,
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", 15)?,
        };

        ensure!(
            config.min_crawl_interval_hours <= config.max_crawl_interval_hours,
            "MIN_CRAWL_INTERVAL_HOURS must not exceed MAX_CRAWL_INTERVAL_HOURS"
        );
        ensure!(
            config.max_concurrent_jobs > 0,
            "MAX_CONCURRENT_JOBS must be at least 1"
        );

        Ok(config)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            ..WorkerConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_max_depth: self.default_max_depth,
            ..SchedulerConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}
