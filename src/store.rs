//! Page/domain persistence.
//!
//! Batched upsert via `QueryBuilder`, with `ON CONFLICT DO UPDATE ...
//! RETURNING` so ids for rows that already existed come back in the same
//! round trip as newly inserted ones.

use sqlx::{PgPool, QueryBuilder};
use tracing::warn;

use crate::domain::Domain;
use crate::error::{AppError, Result};
use crate::urlutil::{normalise_domain, normalise_path};

/// Groups larger than this are split into multiple `INSERT` statements —
/// Postgres caps bind parameters per statement well above this, but keeping
/// batches small bounds the size of a single transaction's write-ahead log
/// entry.
const MAX_BATCH_GROUP: usize = 250;

pub struct PageStore {
    pool: PgPool,
}

impl PageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch or create the `domains` row for `name`.
    pub async fn get_or_create_domain(&self, name: &str) -> Result<Domain> {
        let normalised = normalise_domain(name);
        let row = sqlx::query_as::<_, (i64, String)>(
            "INSERT INTO domains (name) VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, name",
        )
        .bind(&normalised)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        Ok(Domain { id: row.0, name: row.1 })
    }

    /// Upsert page records for a batch of raw URLs against `domain`,
    /// returning `(raw_url, page_id)` pairs in input order. Invalid URLs
    /// are dropped with a warning rather than failing the whole batch.
    /// Duplicate paths within the batch are deduplicated before insert.
    pub async fn create_page_records(
        &self,
        domain: &Domain,
        raw_urls: &[String],
    ) -> Result<Vec<(String, i64)>> {
        let mut normalised: Vec<(String, String)> = Vec::new();
        for raw in raw_urls {
            match normalise_path(raw, &domain.name) {
                Ok(path) => normalised.push((raw.clone(), path)),
                Err(e) => warn!(raw_url = raw, error = %e, "dropping unparseable URL"),
            }
        }

        let mut unique_paths: Vec<String> = normalised.iter().map(|(_, p)| p.clone()).collect();
        unique_paths.sort();
        unique_paths.dedup();

        let mut path_to_id = std::collections::HashMap::new();
        for chunk in unique_paths.chunks(MAX_BATCH_GROUP) {
            for (path, id) in self.upsert_paths(domain.id, chunk).await? {
                path_to_id.insert(path, id);
            }
        }

        Ok(normalised
            .into_iter()
            .filter_map(|(raw, path)| path_to_id.get(&path).map(|id| (raw, *id)))
            .collect())
    }

    async fn upsert_paths(&self, domain_id: i64, paths: &[String]) -> Result<Vec<(String, i64)>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("INSERT INTO pages (domain_id, path) ");
        qb.push_values(paths, |mut b, path| {
            b.push_bind(domain_id).push_bind(path);
        });
        qb.push(
            " ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path
              RETURNING path, id",
        );

        let rows: Vec<(String, i64)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err)?;

        Ok(rows)
    }
}

fn map_db_err(e: sqlx::Error) -> AppError {
    AppError::database(crate::resilience::classify_db_error(&e), e.to_string())
}
