//! Database connection resilience.
//!
//! Connection bootstrap via `sqlx::PgPoolOptions` with `acquire_timeout`,
//! a startup retry loop using exponential backoff with jitter, and
//! SQLSTATE classification so transient failures are distinguished from
//! permanent ones instead of retried uniformly.

use std::time::Duration;

use rand::Rng;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Error as SqlxError, PgPool};
use tracing::{info, warn};

use crate::error::DbErrorKind;

const MAX_CONNECT_ATTEMPTS: u32 = 10;
const BASE_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Build the pool's connect options, appending statement/transaction
/// timeouts and an application_name the way a raw `DATABASE_URL` from an
/// operator's shell typically won't include.
fn augment_dsn(database_url: &str, application_name: &str) -> Result<PgConnectOptions, SqlxError> {
    let options: PgConnectOptions = database_url.parse()?;
    Ok(options.application_name(application_name).options([
        ("statement_timeout", "60000"),
        ("idle_in_transaction_session_timeout", "30000"),
    ]))
}

fn pool_options() -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
}

/// Connect with exponential backoff and jitter, retrying only on
/// transient failures (connection refused, resource exhaustion, admin
/// shutdown). A permanent failure (bad credentials, unknown database)
/// fails fast.
pub async fn wait_for_database(database_url: &str, application_name: &str) -> crate::error::Result<PgPool> {
    let options = augment_dsn(database_url, application_name)
        .map_err(|e| crate::error::AppError::Config(format!("invalid DATABASE_URL: {e}")))?;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match pool_options().connect_with(options.clone()).await {
            Ok(pool) => {
                info!(attempt, "database connection established");
                return Ok(pool);
            }
            Err(e) => {
                let kind = classify_db_error(&e);
                if kind == DbErrorKind::Permanent || attempt >= MAX_CONNECT_ATTEMPTS {
                    return Err(crate::error::AppError::database(kind, e.to_string()));
                }
                let delay = backoff_with_jitter(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "database connection failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32 << attempt.min(10));
    let capped = exp.min(MAX_BACKOFF);
    let jitter_frac: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(capped.as_secs_f64() * jitter_frac)
}

/// Classify a `sqlx::Error` into retry/fail-fast per its SQLSTATE class:
/// class 08 (connection), 53 (insufficient resources), 57 (operator
/// intervention, including 57P01 admin shutdown), and 58 (system error)
/// are transient; everything else — constraint violations, auth
/// failures, syntax errors — is permanent.
pub fn classify_db_error(err: &SqlxError) -> DbErrorKind {
    match err {
        SqlxError::Io(_) | SqlxError::PoolTimedOut | SqlxError::PoolClosed => DbErrorKind::Transient,
        SqlxError::Database(db_err) => match db_err.code() {
            Some(code) => {
                let class = &code[..2.min(code.len())];
                match class {
                    "08" | "53" | "57" | "58" => DbErrorKind::Transient,
                    _ => DbErrorKind::Permanent,
                }
            }
            None => DbErrorKind::Permanent,
        },
        _ => DbErrorKind::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_stays_capped() {
        let small = backoff_with_jitter(1);
        let large = backoff_with_jitter(9);
        assert!(small <= MAX_BACKOFF + Duration::from_millis(1));
        assert!(large <= MAX_BACKOFF.mul_f64(1.51));
    }

    #[test]
    fn augment_dsn_rejects_garbage_url() {
        assert!(augment_dsn("not a dsn", "cache-warmer").is_err());
    }
}
