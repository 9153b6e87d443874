//! In-memory batching of task-status writes.
//!
//! Workers accumulate completed-task results in a shared buffer rather than
//! issuing one `UPDATE` per page; a size/time-triggered writer flushes them
//! together in a single transaction, shared across the whole worker pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{PgPool, QueryBuilder};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::queue::TaskQueue;
use crate::queue::TaskUpdate;

pub struct BatchWriter {
    pool: PgPool,
    queue: Arc<TaskQueue>,
    buffer: Mutex<Vec<TaskUpdate>>,
    flush_interval: Duration,
    flush_size: usize,
}

impl BatchWriter {
    pub fn new(pool: PgPool, queue: Arc<TaskQueue>, flush_interval: Duration, flush_size: usize) -> Arc<Self> {
        Arc::new(Self {
            pool,
            queue,
            buffer: Mutex::new(Vec::with_capacity(flush_size)),
            flush_interval,
            flush_size,
        })
    }

    /// Queue a task-status write. Flushes immediately if the buffer has
    /// reached `flush_size`; otherwise the periodic [`Self::run`] loop or
    /// a shutdown flush will pick it up.
    pub async fn submit(self: &Arc<Self>, update: TaskUpdate) -> Result<()> {
        let should_flush = {
            let mut buf = self.buffer.lock().await;
            buf.push(update);
            should_flush(buf.len(), self.flush_size)
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// ...or every `flush_interval`, whichever comes first. Runs until
    /// `shutdown` fires, then performs one final flush so no buffered
    /// writes are lost.
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        tracing::warn!(error = %e, "periodic batch flush failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("batch writer shutting down, performing final flush");
                    if let Err(e) = self.flush().await {
                        tracing::warn!(error = %e, "final batch flush failed");
                    }
                    break;
                }
            }
        }
    }

    /// Write every buffered update in a single transaction, then recompute
    /// job progress for each affected job exactly once regardless of how
    /// many of its tasks were in the batch.
    pub async fn flush(&self) -> Result<()> {
        let batch = {
            let mut buf = self.buffer.lock().await;
            if buf.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buf)
        };

        debug!(count = batch.len(), "flushing task batch");

        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "UPDATE tasks AS t SET status = u.status, response = u.response, \
             second_fetch = u.second_fetch, completed_at = u.completed_at \
             FROM (",
        );
        qb.push_values(&batch, |mut b, u| {
            b.push_bind(&u.task_id)
                .push_bind(u.status.as_str())
                .push_bind(&u.response_json)
                .push_bind(&u.second_fetch_json)
                .push_bind(u.completed_at);
        });
        qb.push(
            ") AS u(id, status, response, second_fetch, completed_at) \
              WHERE t.id = u.id::uuid",
        );

        qb.build().execute(&mut *tx).await.map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;

        let affected_jobs: HashSet<&str> = batch.iter().map(|u| u.job_id.as_str()).collect();
        for job_id in affected_jobs {
            if let Err(e) = self.queue.update_job_progress(job_id).await {
                tracing::warn!(job_id, error = %e, "failed to recompute job progress after flush");
            }
        }

        Ok(())
    }
}

fn should_flush(buffer_len: usize, flush_size: usize) -> bool {
    buffer_len >= flush_size
}

fn map_db_err(e: sqlx::Error) -> AppError {
    AppError::database(crate::resilience::classify_db_error(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_flush_triggers_once_buffer_reaches_configured_size() {
        assert!(!should_flush(49, 50));
        assert!(should_flush(50, 50));
        assert!(should_flush(51, 50));
    }
}

/// Integration test against a real Postgres, gated on `DATABASE_URL` the
/// same way as `queue::db_tests`.
#[cfg(test)]
mod db_tests {
    use std::sync::Arc;

    use crate::domain::{SourceType, TaskStatus};

    use super::*;

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        sqlx::migrate!("./migrations").run(&pool).await.ok()?;
        Some(pool)
    }

    #[tokio::test]
    async fn flush_applies_batch_atomically_and_recomputes_job_progress() {
        let Some(pool) = test_pool().await else { return };

        let domain: (i64,) = sqlx::query_as("INSERT INTO domains (name) VALUES ($1) RETURNING id")
            .bind(format!("batch-test-{}.example", uuid::Uuid::new_v4()))
            .fetch_one(&pool)
            .await
            .unwrap();
        let page: (i64,) = sqlx::query_as("INSERT INTO pages (domain_id, path) VALUES ($1, '/') RETURNING id")
            .bind(domain.0)
            .fetch_one(&pool)
            .await
            .unwrap();
        let job_id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO jobs (id, domain_id, user_id, organisation_id, status, options) \
             VALUES ($1, $2, 'u', 'o', 'running', '{}')",
        )
        .bind(&job_id)
        .bind(domain.0)
        .execute(&pool)
        .await
        .unwrap();

        let queue = Arc::new(TaskQueue::new(pool.clone(), 3));
        queue.enqueue(&job_id, &[(page.0, SourceType::Manual, 1.0)], 100, 0).await.unwrap();
        let task = queue.claim_next(&job_id, "w1").await.unwrap().unwrap();

        let writer = BatchWriter::new(pool.clone(), Arc::clone(&queue), Duration::from_secs(3600), 50);
        writer
            .submit(TaskUpdate {
                task_id: task.id.clone(),
                job_id: job_id.clone(),
                status: TaskStatus::Completed,
                response_json: serde_json::json!({"status_code": 200, "cache_status": "HIT"}),
                second_fetch_json: None,
                completed_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let status: (String,) = sqlx::query_as("SELECT status FROM tasks WHERE id = $1::uuid")
            .bind(&task.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status.0, "completed");

        let progress: (f64,) = sqlx::query_as("SELECT progress FROM jobs WHERE id = $1")
            .bind(&job_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(progress.0, 1.0);
    }
}
