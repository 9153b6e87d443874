//! Environment-driven configuration for the engine.
//!
//! A single `EngineConfig` struct loaded once from the process
//! environment in `main` and threaded through as a plain value/`Arc`.
//! No process-global singleton, since this engine has no user-facing
//! settings UI to mutate it at runtime.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub worker_base_count: usize,
    pub default_job_concurrency: usize,
    pub cache_warm_delay: Duration,
    pub batch_size: usize,
    pub batch_flush_interval: Duration,
    pub stale_task_timeout: Duration,
    pub stale_recovery_interval: Duration,
    pub job_discovery_interval: Duration,
    pub request_timeout: Duration,
    pub find_links_default: bool,
    pub allow_db_reset: bool,
    pub admin_reset_role: Option<String>,
    pub scheduler_poll_interval: Duration,
    pub max_retries: u32,
    pub user_agent_product: String,
    pub bot_info_url: String,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from the process environment, falling back to
    /// sensible defaults for anything unset.
    pub fn from_env() -> crate::error::Result<Self> {
        let database_url = env_var("DATABASE_URL").ok_or_else(|| {
            crate::error::AppError::Config("DATABASE_URL is not set".to_string())
        })?;

        Ok(Self {
            database_url,
            worker_base_count: env_parse("WORKER_BASE_COUNT", num_cpus::get().max(1)),
            default_job_concurrency: env_parse("DEFAULT_JOB_CONCURRENCY", 4),
            cache_warm_delay: Duration::from_millis(env_parse("CACHE_WARM_DELAY_MS", 1500)),
            batch_size: env_parse("BATCH_SIZE", 50),
            batch_flush_interval: Duration::from_millis(env_parse(
                "BATCH_FLUSH_INTERVAL_MS",
                10_000,
            )),
            stale_task_timeout: Duration::from_secs(env_parse("STALE_TASK_TIMEOUT_SECS", 600)),
            stale_recovery_interval: Duration::from_secs(env_parse(
                "STALE_RECOVERY_INTERVAL_SECS",
                60,
            )),
            job_discovery_interval: Duration::from_secs(env_parse(
                "JOB_DISCOVERY_INTERVAL_SECS",
                5,
            )),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 30)),
            find_links_default: env_parse("FIND_LINKS_DEFAULT", true),
            allow_db_reset: env_parse("ALLOW_DB_RESET", false),
            admin_reset_role: env_var("ADMIN_RESET_ROLE"),
            scheduler_poll_interval: Duration::from_secs(env_parse(
                "SCHEDULER_POLL_INTERVAL_SECS",
                30,
            )),
            max_retries: env_parse("MAX_RETRIES", 3),
            user_agent_product: env_var("USER_AGENT_PRODUCT")
                .unwrap_or_else(|| "CacheWarmerBot/1.0".to_string()),
            bot_info_url: env_var("BOT_INFO_URL")
                .unwrap_or_else(|| "https://example.invalid/bot".to_string()),
        })
    }

    /// Build the `User-Agent` string for a specific worker.
    pub fn user_agent_for_worker(&self, worker_id: usize) -> String {
        format!(
            "{} (+{}) Worker-{}",
            self.user_agent_product, self.bot_info_url, worker_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_includes_worker_suffix() {
        let cfg = EngineConfig {
            database_url: "postgres://localhost/test".into(),
            worker_base_count: 1,
            default_job_concurrency: 1,
            cache_warm_delay: Duration::from_millis(1500),
            batch_size: 50,
            batch_flush_interval: Duration::from_secs(10),
            stale_task_timeout: Duration::from_secs(600),
            stale_recovery_interval: Duration::from_secs(60),
            job_discovery_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            find_links_default: true,
            allow_db_reset: false,
            admin_reset_role: None,
            scheduler_poll_interval: Duration::from_secs(30),
            max_retries: 3,
            user_agent_product: "CacheWarmerBot/1.0".into(),
            bot_info_url: "https://example.invalid/bot".into(),
        };
        let ua = cfg.user_agent_for_worker(7);
        assert!(ua.starts_with("CacheWarmerBot/1.0"));
        assert!(ua.ends_with("Worker-7"));
    }
}
