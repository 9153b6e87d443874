//! Recurring-job scheduler.
//!
//! A `tokio::time::interval` ticks against a `CancellationToken`,
//! polling for due scheduler rows, skipping any whose domain/organisation
//! already has an unfinished job, and otherwise creating a new job from
//! the scheduler's template before advancing `next_run_at`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::JobOptions;
use crate::error::{AppError, Result};
use crate::jobs::JobManager;

pub struct Scheduler {
    pool: PgPool,
    jobs: Arc<JobManager>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(pool: PgPool, jobs: Arc<JobManager>, poll_interval: Duration) -> Self {
        Self { pool, jobs, poll_interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Find schedulers whose `next_run_at` has elapsed, and for each one
    /// not already running an unfinished job for its `(domain, org)` pair,
    /// create a new job from its template and advance `next_run_at`.
    async fn tick(&self) -> Result<()> {
        let due = sqlx::query(
            "SELECT id, domain_id, organisation_id, schedule_interval, template
             FROM schedulers WHERE enabled AND next_run_at <= now()",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        for row in due {
            let scheduler_id: String = row.try_get("id").map_err(map_db_err)?;
            let domain_id: i64 = row.try_get("domain_id").map_err(map_db_err)?;
            let organisation_id: String = row.try_get("organisation_id").map_err(map_db_err)?;
            let interval_hours: i32 = row.try_get("schedule_interval").map_err(map_db_err)?;
            let template: serde_json::Value = row.try_get("template").map_err(map_db_err)?;

            let has_unfinished = sqlx::query(
                "SELECT 1 FROM jobs WHERE domain_id = $1 AND organisation_id = $2
                 AND status IN ('pending','running') LIMIT 1",
            )
            .bind(domain_id)
            .bind(&organisation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?;

            if has_unfinished.is_some() {
                info!(scheduler_id, "skipping due scheduler, an unfinished job already exists");
                continue;
            }

            let mut options: JobOptions = serde_json::from_value(template).unwrap_or_default();
            options.scheduler_id = Some(scheduler_id.clone());
            if let Err(e) = self.jobs.create_job(options).await {
                warn!(scheduler_id, error = %e, "scheduled job creation failed");
                continue;
            }

            sqlx::query("UPDATE schedulers SET next_run_at = now() + ($2 || ' hours')::interval WHERE id = $1")
                .bind(&scheduler_id)
                .bind(interval_hours.to_string())
                .execute(&self.pool)
                .await
                .map_err(map_db_err)?;
        }

        Ok(())
    }
}

fn map_db_err(e: sqlx::Error) -> AppError {
    AppError::database(crate::resilience::classify_db_error(&e), e.to_string())
}
