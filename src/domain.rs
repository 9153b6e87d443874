//! Data model for the cache-warming engine.
//!
//! Consolidated entity structs with `as_str`/`FromStr`/`Display` triads on
//! status enums and `Default` impls where a sensible default exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// DOMAIN / PAGE
// ============================================================================

/// A host, normalised per `urlutil::normalise_domain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: i64,
    pub name: String,
}

/// A path within a domain, normalised per `urlutil::normalise_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: i64,
    pub domain_id: i64,
    pub path: String,
}

// ============================================================================
// JOB
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Valid forward transitions: pending -> running ->
    /// {completed, cancelled, failed} only.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, Self::Completed)
            | (Self::Running, Self::Cancelled)
            | (Self::Running, Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job creation / crawl options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    pub domain: String,
    pub use_sitemap: bool,
    pub find_links: bool,
    pub max_pages: i64,
    pub concurrency: i64,
    pub required_workers: i64,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub priority: f64,
    pub user_id: String,
    pub organisation_id: String,
    pub scheduler_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            domain: String::new(),
            use_sitemap: true,
            find_links: true,
            max_pages: 1000,
            concurrency: 4,
            required_workers: 1,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            priority: 0.0,
            user_id: String::new(),
            organisation_id: String::new(),
            scheduler_id: None,
        }
    }
}

/// Per-job counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCounters {
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    pub found_tasks: i64,
    pub sitemap_tasks: i64,
}

impl JobCounters {
    /// Invariant: `total_tasks = sitemap_tasks + found_tasks`.
    pub fn totals_consistent(&self) -> bool {
        self.total_tasks == self.sitemap_tasks + self.found_tasks
            && self.completed_tasks + self.failed_tasks + self.skipped_tasks <= self.total_tasks
    }

    /// Non-skipped task count, used for `max_pages` enforcement.
    pub fn non_skipped(&self) -> i64 {
        self.total_tasks - self.skipped_tasks
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub domain_id: i64,
    pub user_id: String,
    pub organisation_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub counters: JobCounters,
    pub options: JobOptions,
    pub scheduler_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(domain_id: i64, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain_id,
            user_id: options.user_id.clone(),
            organisation_id: options.organisation_id.clone(),
            status: JobStatus::Pending,
            progress: 0.0,
            counters: JobCounters::default(),
            scheduler_id: options.scheduler_id.clone(),
            options,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Derived, read-only view of a job's progress returned by `GetJobStatus`,
/// beyond the bare `status` column: completion percentage and aggregate
/// fetch quality across its completed tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub status: JobStatus,
    pub counters: JobCounters,
    pub percentage: f64,
    pub average_response_time_ms: Option<f64>,
    pub cache_hit_ratio: Option<f64>,
}

// ============================================================================
// TASK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Sitemap,
    Link,
    Manual,
    Nav,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sitemap => "sitemap",
            Self::Link => "link",
            Self::Manual => "manual",
            Self::Nav => "nav",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sitemap" => Ok(Self::Sitemap),
            "link" => Ok(Self::Link),
            "manual" => Ok(Self::Manual),
            "nav" => Ok(Self::Nav),
            _ => Err(()),
        }
    }
}

/// Normalised CDN cache-status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    Hit,
    Miss,
    Dynamic,
    Bypass,
    Expired,
    Stale,
    Revalidated,
    Updating,
    Prerender,
    Pass,
    Unknown,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Dynamic => "DYNAMIC",
            Self::Bypass => "BYPASS",
            Self::Expired => "EXPIRED",
            Self::Stale => "STALE",
            Self::Revalidated => "REVALIDATED",
            Self::Updating => "UPDATING",
            Self::Prerender => "PRERENDER",
            Self::Pass => "PASS",
            Self::Unknown => "",
        }
    }

    /// Statuses eligible for a confirming second fetch.
    pub fn warrants_second_fetch(&self) -> bool {
        matches!(self, Self::Miss | Self::Bypass)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTiming {
    pub dns_ms: Option<f64>,
    pub tcp_ms: Option<f64>,
    pub tls_ms: Option<f64>,
    pub ttfb_ms: Option<f64>,
    pub content_transfer_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status_code: Option<i32>,
    pub response_time_ms: Option<f64>,
    pub cache_status: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub redirect_url: Option<String>,
    pub headers: Option<serde_json::Value>,
    pub timing: TaskTiming,
    pub error: Option<String>,
}

/// Second-fetch mirror fields from two-phase warming.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecondFetch {
    pub status_code: Option<i32>,
    pub response_time_ms: Option<f64>,
    pub cache_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    pub page_id: i64,
    pub status: TaskStatus,
    pub priority_score: f64,
    pub retry_count: i32,
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response: TaskResponse,
    pub second_fetch: Option<SecondFetch>,
    pub cache_check_attempts: i32,
    // Denormalised fields returned alongside a claim.
    pub path: Option<String>,
    pub domain_name: Option<String>,
}

impl Task {
    pub fn new(job_id: String, page_id: i64, source_type: SourceType, priority_score: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id,
            page_id,
            status: TaskStatus::Pending,
            priority_score,
            retry_count: 0,
            source_type,
            source_url: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            response: TaskResponse::default(),
            second_fetch: None,
            cache_check_attempts: 0,
            path: None,
            domain_name: None,
        }
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleInterval {
    Hours6,
    Hours12,
    Hours24,
    Hours48,
}

impl ScheduleInterval {
    pub fn as_hours(&self) -> i64 {
        match self {
            Self::Hours6 => 6,
            Self::Hours12 => 12,
            Self::Hours24 => 24,
            Self::Hours48 => 48,
        }
    }

    pub fn from_hours(h: i64) -> Option<Self> {
        match h {
            6 => Some(Self::Hours6),
            12 => Some(Self::Hours12),
            24 => Some(Self::Hours24),
            48 => Some(Self::Hours48),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scheduler {
    pub id: String,
    pub domain_id: i64,
    pub organisation_id: String,
    pub schedule_interval: ScheduleInterval,
    pub next_run_at: DateTime<Utc>,
    pub enabled: bool,
    pub template: JobOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_transitions_are_forward_only() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn counters_consistency_invariant() {
        let mut c = JobCounters {
            total_tasks: 3,
            sitemap_tasks: 2,
            found_tasks: 1,
            completed_tasks: 1,
            failed_tasks: 1,
            skipped_tasks: 1,
        };
        assert!(c.totals_consistent());
        c.total_tasks = 4;
        assert!(!c.totals_consistent());
    }

    #[test]
    fn cache_status_second_fetch_eligibility() {
        assert!(CacheStatus::Miss.warrants_second_fetch());
        assert!(CacheStatus::Bypass.warrants_second_fetch());
        assert!(!CacheStatus::Hit.warrants_second_fetch());
        assert!(!CacheStatus::Dynamic.warrants_second_fetch());
    }
}
