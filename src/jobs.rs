//! Job manager: creation, sitemap seeding, cancellation.
//!
//! Cancellation flags live in a `DashMap` keyed by job id, checked
//! cooperatively by in-flight work. Job creation seeds its task list from
//! the domain's sitemap, then runs an explicit nav/homepage priority boost
//! before the job is handed to the worker pool.

use std::sync::Arc;

use scraper::{Html, Selector};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::domain::{Job, JobOptions, JobStatus, JobStatusReport, SourceType, Task};
use crate::error::{AppError, Result};
use crate::pool::JobRegistry;
use crate::queue::{TaskListFilter, TaskQueue};
use crate::robots::fetch_robots;
use crate::sitemap::{discover_sitemaps, fetch_and_parse_sitemap};
use crate::store::PageStore;

/// Selector for primary navigation links, used to boost the pages a real
/// visitor reaches first above the bulk of sitemap-seeded tasks.
const NAV_LINK_SELECTOR: &str = "nav a[href], header a[href], [role='navigation'] a[href]";
const NAV_BOOST_AMOUNT: f64 = 100.0;

pub struct JobManager {
    pool: PgPool,
    queue: Arc<TaskQueue>,
    store: Arc<PageStore>,
    registry: Arc<JobRegistry>,
    http: reqwest::Client,
    user_agent_product: String,
}

impl JobManager {
    pub fn new(
        pool: PgPool,
        queue: Arc<TaskQueue>,
        store: Arc<PageStore>,
        registry: Arc<JobRegistry>,
        http: reqwest::Client,
        user_agent_product: String,
    ) -> Self {
        Self { pool, queue, store, registry, http, user_agent_product }
    }

    /// Create a job row, seed it (sitemap discovery + nav boost, run
    /// synchronously before returning so the worker pool sees a
    /// fully-populated task list as soon as the job becomes visible), then
    /// mark it `running` and register it with the worker pool.
    pub async fn create_job(&self, options: JobOptions) -> Result<Job> {
        let domain = self.store.get_or_create_domain(&options.domain).await?;
        let mut job = Job::new(domain.id, options.clone());

        sqlx::query(
            "INSERT INTO jobs (id, domain_id, user_id, organisation_id, status, options, scheduler_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&job.id)
        .bind(domain.id)
        .bind(&job.user_id)
        .bind(&job.organisation_id)
        .bind(job.status.as_str())
        .bind(serde_json::to_value(&job.options).unwrap_or_default())
        .bind(&job.scheduler_id)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        let sitemap_inserted = if options.use_sitemap {
            self.seed_from_sitemap(&job.id, &domain.name, &options).await?
        } else {
            0
        };

        if sitemap_inserted == 0 {
            self.seed_manual_root(&job.id, &domain, &options).await?;
        }

        self.boost_nav_priority(&job.id, &domain.name).await?;

        self.start_job(&job.id).await?;
        job.status = JobStatus::Running;
        job.started_at = Some(chrono::Utc::now());

        Ok(job)
    }

    /// Returns the number of tasks actually inserted, so the caller can
    /// fall back to a manual root seed when sitemap discovery finds
    /// nothing (no sitemap, everything filtered out, or a dead sitemap URL).
    async fn seed_from_sitemap(&self, job_id: &str, domain_name: &str, options: &JobOptions) -> Result<i64> {
        let robots = fetch_robots(&self.http, domain_name, &self.user_agent_product).await;
        let base = url::Url::parse(&format!("https://{domain_name}/"))
            .map_err(|e| AppError::InvalidUrl(e.to_string()))?;

        let sitemaps = discover_sitemaps(&self.http, &base, &robots.sitemaps).await;

        let mut all_urls = Vec::new();
        for sitemap_url in &sitemaps {
            all_urls.extend(fetch_and_parse_sitemap(&self.http, sitemap_url).await);
        }

        let filtered: Vec<String> = all_urls
            .into_iter()
            .map(|u| u.to_string())
            .filter(|raw| path_allowed(raw, options))
            .filter(|raw| robots.is_allowed(raw))
            .collect();

        if filtered.is_empty() {
            return Ok(0);
        }

        let domain = self.store.get_or_create_domain(domain_name).await?;
        let pairs = self.store.create_page_records(&domain, &filtered).await?;
        let entries: Vec<_> = pairs
            .into_iter()
            .map(|(_, page_id)| (page_id, SourceType::Sitemap, 10.0))
            .collect();

        let inserted = self.queue.enqueue(job_id, &entries, options.max_pages, 0).await?;
        info!(job_id, inserted, "seeded job from sitemap");
        Ok(inserted)
    }

    /// Seed a job with just its homepage when sitemap discovery isn't
    /// requested or comes back empty, so a job never ends up with zero
    /// tasks and nothing for the worker pool to ever claim.
    async fn seed_manual_root(&self, job_id: &str, domain: &crate::domain::Domain, options: &JobOptions) -> Result<()> {
        let pairs = self.store.create_page_records(domain, &["/".to_string()]).await?;
        let entries: Vec<_> = pairs
            .into_iter()
            .map(|(_, page_id)| (page_id, SourceType::Manual, 10.0))
            .collect();
        let inserted = self.queue.enqueue(job_id, &entries, options.max_pages, 0).await?;
        info!(job_id, inserted, "seeded job with manual root task");
        Ok(())
    }

    /// Fetch the homepage and boost whatever `<nav>`/primary-navigation
    /// links it actually contains, rather than just re-boosting "/" itself.
    /// Falls back to boosting only the homepage if the fetch or parse
    /// yields nothing, since a boost of zero paths would be a silent no-op.
    async fn boost_nav_priority(&self, job_id: &str, domain_name: &str) -> Result<()> {
        let mut paths = self.fetch_nav_paths(domain_name).await;
        if !paths.contains(&"/".to_string()) {
            paths.push("/".to_string());
        }
        self.queue.boost_priority_for_paths(job_id, &paths, NAV_BOOST_AMOUNT).await
    }

    async fn fetch_nav_paths(&self, domain_name: &str) -> Vec<String> {
        let base = match url::Url::parse(&format!("https://{domain_name}/")) {
            Ok(u) => u,
            Err(_) => return Vec::new(),
        };

        let body = match self.http.get(base.clone()).send().await {
            Ok(resp) => match resp.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(domain_name, error = %e, "failed reading homepage body for nav extraction");
                    return Vec::new();
                }
            },
            Err(e) => {
                warn!(domain_name, error = %e, "failed fetching homepage for nav extraction");
                return Vec::new();
            }
        };

        extract_nav_paths(&body, &base)
    }

    pub async fn start_job(&self, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'running', started_at = now() WHERE id = $1 AND status = 'pending'")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;

        let required_workers = sqlx::query("SELECT options->>'required_workers' AS rw FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?
            .and_then(|r| r.try_get::<String, _>("rw").ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(1);

        self.registry.add_job(job_id, required_workers);
        Ok(())
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        self.registry.cancel_job(job_id);
        sqlx::query("UPDATE jobs SET status = 'cancelled', completed_at = now() WHERE id = $1 AND status IN ('pending','running')")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        self.registry.remove_job(job_id);
        Ok(())
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobStatusReport> {
        self.queue.job_status(job_id).await
    }

    pub async fn list_tasks(&self, job_id: &str, filter: &TaskListFilter, limit: i64, offset: i64) -> Result<Vec<Task>> {
        self.queue.list_tasks(job_id, filter, limit, offset).await
    }
}

fn path_allowed(raw_url: &str, options: &JobOptions) -> bool {
    let path = url::Url::parse(raw_url).map(|u| u.path().to_string()).unwrap_or_default();
    if !options.include_paths.is_empty() && !options.include_paths.iter().any(|p| path.starts_with(p)) {
        return false;
    }
    if options.exclude_paths.iter().any(|p| path.starts_with(p)) {
        return false;
    }
    true
}

/// Resolve nav/header `<a href>` links against `base`, keeping same-host
/// http(s) links and deduplicating by path.
fn extract_nav_paths(html: &str, base: &url::Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse(NAV_LINK_SELECTOR) else {
        return Vec::new();
    };

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else { continue };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let Ok(resolved) = base.join(href) else { continue };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        if resolved.host_str() != base.host_str() {
            continue;
        }
        let path = resolved.path().to_string();
        if seen.insert(path.clone()) {
            out.push(path);
        }
    }

    out
}

fn map_db_err(e: sqlx::Error) -> AppError {
    AppError::database(crate::resilience::classify_db_error(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_allowed_respects_include_and_exclude() {
        let mut options = JobOptions::default();
        options.include_paths = vec!["/blog".to_string()];
        assert!(path_allowed("https://example.com/blog/post-1", &options));
        assert!(!path_allowed("https://example.com/shop/item-1", &options));

        let mut excl = JobOptions::default();
        excl.exclude_paths = vec!["/admin".to_string()];
        assert!(!path_allowed("https://example.com/admin/panel", &excl));
        assert!(path_allowed("https://example.com/blog", &excl));
    }

    #[test]
    fn extract_nav_paths_keeps_same_host_links_from_nav_and_header() {
        let base = url::Url::parse("https://example.com/").unwrap();
        let html = r#"
            <header><a href="/pricing">Pricing</a></header>
            <nav><a href="/docs">Docs</a><a href="https://example.com/docs">Docs again</a></nav>
            <nav><a href="https://other.com/evil">off-site</a></nav>
            <main><a href="/not-nav">body link</a></main>
        "#;
        let paths = extract_nav_paths(html, &base);
        assert!(paths.contains(&"/pricing".to_string()));
        assert!(paths.contains(&"/docs".to_string()));
        assert!(!paths.contains(&"/not-nav".to_string()));
        assert!(!paths.iter().any(|p| p.contains("evil")));
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn extract_nav_paths_returns_empty_for_no_nav_markup() {
        let base = url::Url::parse("https://example.com/").unwrap();
        assert!(extract_nav_paths("<main><a href=\"/a\">a</a></main>", &base).is_empty());
    }
}
