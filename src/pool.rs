//! Adaptive worker pool.
//!
//! Each worker is a long-lived tokio task, polling for work and shut down
//! via a `CancellationToken`, with per-job worker accounting so the pool
//! scales to the largest `required_workers` among active jobs rather than a
//! single hardcoded worker count. A periodic scaling pass reconciles the
//! number of running workers with that target at runtime, so adding or
//! removing a job actually grows or shrinks the pool instead of only taking
//! effect on the next process restart.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::batch::BatchWriter;
use crate::crawler::Crawler;
use crate::domain::{SourceType, Task, TaskResponse, TaskStatus};
use crate::queue::{TaskQueue, TaskUpdate};
use crate::robots::fetch_robots;
use crate::store::PageStore;

const EMPTY_POLL_BASE_BACKOFF: Duration = Duration::from_millis(200);
const EMPTY_POLL_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Tracks per-job required worker counts so the pool can compute
/// `current_workers = max(base_workers, max over active jobs' required_workers)`.
#[derive(Default)]
pub struct JobRegistry {
    required: DashMap<String, i64>,
    cancelled: DashMap<String, Arc<AtomicBool>>,
}

impl JobRegistry {
    pub fn add_job(&self, job_id: &str, required_workers: i64) {
        self.required.insert(job_id.to_string(), required_workers);
        self.cancelled.insert(job_id.to_string(), Arc::new(AtomicBool::new(false)));
    }

    pub fn remove_job(&self, job_id: &str) {
        self.required.remove(job_id);
        self.cancelled.remove(job_id);
    }

    pub fn cancel_job(&self, job_id: &str) {
        if let Some(flag) = self.cancelled.get(job_id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self, job_id: &str) -> bool {
        self.cancelled.get(job_id).map(|f| f.load(Ordering::SeqCst)).unwrap_or(false)
    }

    pub fn active_job_ids(&self) -> Vec<String> {
        self.required.iter().map(|e| e.key().clone()).collect()
    }

    fn required_worker_max(&self) -> i64 {
        self.required.iter().map(|e| *e.value()).max().unwrap_or(0)
    }
}

struct WorkerHandle {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    store: Arc<PageStore>,
    batch: Arc<BatchWriter>,
    registry: Arc<JobRegistry>,
    base_workers: usize,
    user_agent_product: String,
    bot_info_url: String,
    request_timeout: Duration,
    find_links_default: bool,
    cache_warm_delay: Duration,
    job_discovery_interval: Duration,
    stale_recovery_interval: Duration,
    stale_task_timeout: chrono::Duration,
    workers: Mutex<Vec<WorkerHandle>>,
    next_worker_id: AtomicUsize,
    last_request_at: DashMap<String, Instant>,
    crawl_delays: DashMap<String, f64>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        store: Arc<PageStore>,
        batch: Arc<BatchWriter>,
        registry: Arc<JobRegistry>,
        base_workers: usize,
        user_agent_product: String,
        bot_info_url: String,
        request_timeout: Duration,
        find_links_default: bool,
        cache_warm_delay: Duration,
        job_discovery_interval: Duration,
        stale_recovery_interval: Duration,
        stale_task_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            batch,
            registry,
            base_workers,
            user_agent_product,
            bot_info_url,
            request_timeout,
            find_links_default,
            cache_warm_delay,
            job_discovery_interval,
            stale_recovery_interval,
            stale_task_timeout: chrono::Duration::from_std(stale_task_timeout)
                .unwrap_or(chrono::Duration::seconds(600)),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
            last_request_at: DashMap::new(),
            crawl_delays: DashMap::new(),
        }
    }

    fn current_worker_count(&self) -> usize {
        self.base_workers.max(self.registry.required_worker_max().max(0) as usize)
    }

    /// Run the pool: a scaling loop that keeps the live worker count at
    /// `current_worker_count()`, a job-discovery monitor, and a stale-task
    /// recovery monitor, all tied to `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(base_workers = self.base_workers, "starting worker pool");

        let scaling = {
            let pool = Arc::clone(&self);
            let token = shutdown.clone();
            tokio::spawn(async move { pool.scaling_loop(token).await })
        };

        let discovery = {
            let pool = Arc::clone(&self);
            let token = shutdown.clone();
            tokio::spawn(async move { pool.discovery_loop(token).await })
        };

        let recovery = {
            let pool = Arc::clone(&self);
            let token = shutdown.clone();
            tokio::spawn(async move { pool.recovery_loop(token).await })
        };

        shutdown.cancelled().await;
        let _ = scaling.await;

        let handles = {
            let mut workers = self.workers.lock().await;
            std::mem::take(&mut *workers)
        };
        for w in handles {
            let _ = w.join.await;
        }
        let _ = discovery.await;
        let _ = recovery.await;
        info!("worker pool shut down");
    }

    async fn scaling_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            self.scale_workers(&shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.job_discovery_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Reconcile the number of running worker tasks with
    /// `current_worker_count()`. Each worker gets its own `CancellationToken`
    /// derived from `shutdown` via `child_token()`, so retiring one excess
    /// worker doesn't disturb the others, while a pool-wide shutdown still
    /// cancels every worker through the parent token.
    async fn scale_workers(self: &Arc<Self>, shutdown: &CancellationToken) {
        let desired = self.current_worker_count();
        let mut retired = Vec::new();

        {
            let mut workers = self.workers.lock().await;
            workers.retain(|w| !w.join.is_finished());

            while workers.len() < desired {
                let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
                let token = shutdown.child_token();
                let pool = Arc::clone(self);
                let worker_token = token.clone();
                let join = tokio::spawn(async move { pool.worker_loop(id, worker_token).await });
                info!(worker_id = id, desired, "spawned worker");
                workers.push(WorkerHandle { token, join });
            }

            while workers.len() > desired {
                if let Some(w) = workers.pop() {
                    w.token.cancel();
                    retired.push(w.join);
                }
            }
        }

        for join in retired {
            let _ = join.await;
        }
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        let user_agent = format!(
            "{} (+{}) Worker-{}",
            self.user_agent_product, self.bot_info_url, worker_id
        );
        let Ok(crawler) = Crawler::new(&user_agent, self.request_timeout, self.find_links_default, self.cache_warm_delay)
        else {
            warn!(worker_id, "failed to build crawler client, worker exiting");
            return;
        };

        let mut backoff = EMPTY_POLL_BASE_BACKOFF;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let job_ids = self.registry.active_job_ids();
            let mut claimed_any = false;

            for job_id in job_ids {
                if self.registry.is_cancelled(&job_id) {
                    continue;
                }
                match self.queue.claim_next(&job_id, &worker_id.to_string()).await {
                    Ok(Some(task)) => {
                        claimed_any = true;
                        backoff = EMPTY_POLL_BASE_BACKOFF;
                        self.process_task(&crawler, task, &shutdown).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(worker_id, job_id, error = %e, "claim failed"),
                }
            }

            if !claimed_any {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => break,
                }
                backoff = (backoff * 2).min(EMPTY_POLL_MAX_BACKOFF);
            }
        }
    }

    async fn process_task(&self, crawler: &Crawler, task: Task, shutdown: &CancellationToken) {
        let Some(domain_name) = task.domain_name.as_deref() else {
            warn!(task_id = %task.id, "claimed task missing denormalised domain name");
            return;
        };
        let Some(path) = task.path.as_deref() else {
            warn!(task_id = %task.id, "claimed task missing denormalised path");
            return;
        };

        self.enforce_crawl_delay(crawler, domain_name).await;

        let raw_url = format!("https://{domain_name}{path}");
        let Ok(url) = Url::parse(&raw_url) else {
            self.finish(&task, TaskStatus::Failed, TaskResponse {
                error: Some(format!("unparseable url: {raw_url}")),
                ..Default::default()
            }, None).await;
            return;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let watcher_token = shutdown.clone();
        let job_id = task.job_id.clone();
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            loop {
                if watcher_token.is_cancelled() || registry.is_cancelled(&job_id) {
                    let _ = cancel_tx.send(true);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });

        let (response, second_fetch, links) = crawler.warm(&url, &cancel_rx).await;
        let status = if response.error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };

        if self.find_links_default && !links.is_empty() {
            if let Err(e) = self.discover_links(&task.job_id, domain_name, &links).await {
                warn!(job_id = %task.job_id, error = %e, "failed to enqueue discovered links");
            }
        }

        let second_fetch_json = second_fetch.and_then(|sf| serde_json::to_value(sf).ok());
        self.finish(&task, status, response, second_fetch_json).await;
    }

    /// Enforce a minimum spacing between requests to the same domain, per
    /// that domain's robots.txt `Crawl-delay`. Looked up once per domain
    /// (via the crawler's own SSRF-safe client) and cached for the life of
    /// the pool, since robots directives don't change request-to-request.
    async fn enforce_crawl_delay(&self, crawler: &Crawler, domain_name: &str) {
        let delay_s = self.crawl_delay_for_domain(crawler, domain_name).await;
        if delay_s <= 0.0 {
            return;
        }
        let min_gap = Duration::from_secs_f64(delay_s);

        let wait = self.last_request_at.get(domain_name).and_then(|last| {
            let elapsed = last.elapsed();
            if elapsed < min_gap {
                Some(min_gap - elapsed)
            } else {
                None
            }
        });

        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        self.last_request_at.insert(domain_name.to_string(), Instant::now());
    }

    async fn crawl_delay_for_domain(&self, crawler: &Crawler, domain_name: &str) -> f64 {
        if let Some(delay) = self.crawl_delays.get(domain_name) {
            return *delay;
        }
        let rules = fetch_robots(crawler.http_client(), domain_name, &self.user_agent_product).await;
        let delay = rules.crawl_delay_s.unwrap_or(0.0);
        self.crawl_delays.insert(domain_name.to_string(), delay);
        delay
    }

    async fn discover_links(&self, job_id: &str, domain_name: &str, links: &[Url]) -> crate::error::Result<()> {
        let domain = self.store.get_or_create_domain(domain_name).await?;
        let raw: Vec<String> = links.iter().map(|u| u.to_string()).collect();
        let pairs = self.store.create_page_records(&domain, &raw).await?;
        let entries: Vec<(i64, SourceType, f64)> =
            pairs.into_iter().map(|(_, page_id)| (page_id, SourceType::Link, 0.0)).collect();
        self.queue.enqueue_discovered(job_id, &entries).await?;
        Ok(())
    }

    async fn finish(
        &self,
        task: &Task,
        status: TaskStatus,
        response: TaskResponse,
        second_fetch_json: Option<serde_json::Value>,
    ) {
        let response_json = serde_json::to_value(&response).unwrap_or(serde_json::Value::Null);
        let update = TaskUpdate {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            status,
            response_json,
            second_fetch_json,
            completed_at: chrono::Utc::now(),
        };
        if let Err(e) = self.batch.submit(update).await {
            warn!(task_id = %task.id, error = %e, "failed to submit task update to batch writer");
        }
    }

    /// Scan for jobs with pending work that the in-memory registry doesn't
    /// know about and register them. The registry is wiped on every
    /// process restart; this is what lets jobs already `running` in
    /// Postgres pick workers back up without any external coordinator
    /// re-announcing them.
    async fn discovery_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.job_discovery_interval) => {}
                _ = shutdown.cancelled() => break,
            }

            match self.queue.discover_active_jobs().await {
                Ok(active) => {
                    let known: HashSet<String> = self.registry.active_job_ids().into_iter().collect();
                    for (job_id, required_workers) in active {
                        if !known.contains(&job_id) {
                            info!(job_id, required_workers, "discovered active job, registering with worker pool");
                            self.registry.add_job(&job_id, required_workers);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "job discovery scan failed"),
            }
        }
    }

    async fn recovery_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.stale_recovery_interval) => {}
                _ = shutdown.cancelled() => break,
            }
            match self.queue.cleanup_stale_tasks(self.stale_task_timeout).await {
                Ok(n) if n > 0 => info!(reclaimed = n, "stale task recovery ran"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "stale task recovery failed"),
            }
            match self.queue.cleanup_stuck_jobs(self.stale_task_timeout * 3).await {
                Ok(n) if n > 0 => info!(failed = n, "stuck jobs with no live tasks marked failed"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "stuck job cleanup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_worker_count_uses_max_not_sum_across_jobs() {
        let registry = JobRegistry::default();
        registry.add_job("j1", 2);
        registry.add_job("j2", 5);
        assert_eq!(registry.required_worker_max(), 5);
    }

    #[test]
    fn cancel_job_sets_flag_for_that_job_only() {
        let registry = JobRegistry::default();
        registry.add_job("j1", 1);
        registry.add_job("j2", 1);
        registry.cancel_job("j1");
        assert!(registry.is_cancelled("j1"));
        assert!(!registry.is_cancelled("j2"));
    }
}
