//! Binary entrypoint: load configuration, connect to Postgres, start the
//! worker pool, batch writer, and scheduler, then wait for SIGINT/SIGTERM.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cache_warmer::batch::BatchWriter;
use cache_warmer::config::EngineConfig;
use cache_warmer::jobs::JobManager;
use cache_warmer::pool::{JobRegistry, WorkerPool};
use cache_warmer::queue::TaskQueue;
use cache_warmer::resilience::wait_for_database;
use cache_warmer::scheduler::Scheduler;
use cache_warmer::store::PageStore;
use cache_warmer::telemetry;

#[tokio::main]
async fn main() {
    telemetry::init();

    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let pool = match wait_for_database(&config.database_url, &config.user_agent_product).await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to connect to database");
            std::process::exit(1);
        }
    };

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        error!(error = %e, "database migration failed");
        std::process::exit(1);
    }

    let task_queue = Arc::new(TaskQueue::new(pool.clone(), config.max_retries));
    let page_store = Arc::new(PageStore::new(pool.clone()));
    let registry = Arc::new(JobRegistry::default());
    let batch_writer = BatchWriter::new(
        pool.clone(),
        Arc::clone(&task_queue),
        config.batch_flush_interval,
        config.batch_size,
    );

    let http_client = match reqwest::Client::builder()
        .user_agent(config.user_agent_product.clone())
        .timeout(config.request_timeout)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build http client");
            std::process::exit(1);
        }
    };

    let job_manager = Arc::new(JobManager::new(
        pool.clone(),
        Arc::clone(&task_queue),
        Arc::clone(&page_store),
        Arc::clone(&registry),
        http_client,
        config.user_agent_product.clone(),
    ));

    let worker_pool = Arc::new(WorkerPool::new(
        Arc::clone(&task_queue),
        Arc::clone(&page_store),
        Arc::clone(&batch_writer),
        Arc::clone(&registry),
        config.worker_base_count,
        config.user_agent_product.clone(),
        config.bot_info_url.clone(),
        config.request_timeout,
        config.find_links_default,
        config.cache_warm_delay,
        config.job_discovery_interval,
        config.stale_recovery_interval,
        config.stale_task_timeout,
    ));

    let shutdown = CancellationToken::new();
    let (batch_shutdown_tx, batch_shutdown_rx) = tokio::sync::mpsc::channel(1);

    let pool_handle = {
        let pool = Arc::clone(&worker_pool);
        let token = shutdown.clone();
        tokio::spawn(async move { pool.run(token).await })
    };

    let batch_handle = {
        let writer = Arc::clone(&batch_writer);
        tokio::spawn(async move { writer.run(batch_shutdown_rx).await })
    };

    let scheduler_handle = {
        let scheduler = Scheduler::new(pool.clone(), Arc::clone(&job_manager), config.scheduler_poll_interval);
        let token = shutdown.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    info!("cache-warmer running");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining workers");

    shutdown.cancel();
    let _ = pool_handle.await;
    let _ = batch_shutdown_tx.send(()).await;
    let _ = batch_handle.await;
    let _ = scheduler_handle.await;

    info!("shutdown complete");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
