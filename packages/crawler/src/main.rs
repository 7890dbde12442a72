// Main entry point for the crawl service.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawler_core::controls::Controls;
use crawler_core::indexer::{Indexer, SqlIndexer};
use crawler_core::jobs::{JobStore, PostgresJobStore};
use crawler_core::scheduler::BackgroundScheduler;
use crawler_core::state::{ProgressStore, RedisProgressStore};
use crawler_core::worker::CrawlWorker;
use crawler_core::Config;
use page_fetch::{HeuristicScorer, HttpPageFetcher, PageFetcher, PageScorer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crawler_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting crawl service");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));
    let progress: Arc<dyn ProgressStore> = Arc::new(
        RedisProgressStore::new(&config.redis_url).context("Failed to configure Redis")?,
    );
    let controls = Arc::new(Controls::new(
        config.min_crawl_interval_hours,
        config.max_crawl_interval_hours,
    ));
    let fetcher: Arc<dyn PageFetcher> = Arc::new(
        HttpPageFetcher::new(&config.user_agent, config.request_timeout())
            .context("Failed to build HTTP client")?,
    );
    let scorer: Arc<dyn PageScorer> = Arc::new(HeuristicScorer);
    let indexer: Arc<dyn Indexer> = Arc::new(SqlIndexer::new(pool.clone()));

    let worker = CrawlWorker::new(
        Arc::clone(&store),
        Arc::clone(&progress),
        fetcher,
        scorer,
        Arc::clone(&controls),
        config.worker_config(),
    );

    let scheduler = Arc::new(BackgroundScheduler::new(
        store,
        progress,
        indexer,
        controls,
        config.scheduler_config(),
    ));

    let cancel = CancellationToken::new();
    let mut periodic = scheduler.start().await?;
    let worker_task = tokio::spawn(worker.run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    cancel.cancel();
    if let Err(e) = periodic.shutdown().await {
        tracing::warn!(error = %e, "background scheduler did not shut down cleanly");
    }
    worker_task
        .await
        .context("Worker task panicked")?
        .context("Worker failed")?;

    tracing::info!("Crawl service stopped");
    Ok(())
}
