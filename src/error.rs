//! Error types for the cache-warming engine.
//!
//! Provides a structured taxonomy distinguishing transient from permanent
//! failures so callers can decide whether to retry, skip, or fail a job
//! outright. Internal repository and service code leans on
//! `anyhow::Context` for ad-hoc wrapping and converts to `AppError` at
//! public boundaries (queue, store, crawler, job manager).

use thiserror::Error;

/// Whether a database failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Connection reset, resource exhaustion, admin disconnect, deadline
    /// exceeded — retry with backoff.
    Transient,
    /// Auth failure, constraint violation, bad config — fail fast.
    Permanent,
}

/// Whether an HTTP failure is worth retrying within a task's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    /// Network error, 5xx, 429, TLS handshake failure.
    Transient,
    /// 4xx (other than 429), malformed response.
    Permanent,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("blocked connection to private/local IP for host {host}")]
    Ssrf { host: String },

    #[error("database error ({kind:?}): {message}")]
    Database { kind: DbErrorKind, message: String },

    #[error("http error ({kind:?}): {message}")]
    Http { kind: HttpErrorKind, message: String },

    #[error("robots.txt disallows {url}")]
    RobotsBlocked { url: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn database(kind: DbErrorKind, msg: impl Into<String>) -> Self {
        Self::Database { kind, message: msg.into() }
    }

    pub fn http(kind: HttpErrorKind, msg: impl Into<String>) -> Self {
        Self::Http { kind, message: msg.into() }
    }

    /// True when a task-level retry is warranted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database { kind: DbErrorKind::Transient, .. }
                | Self::Http { kind: HttpErrorKind::Transient, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_db_error_is_retryable() {
        let e = AppError::database(DbErrorKind::Transient, "connection reset");
        assert!(e.is_retryable());
    }

    #[test]
    fn permanent_db_error_is_not_retryable() {
        let e = AppError::database(DbErrorKind::Permanent, "unique violation");
        assert!(!e.is_retryable());
    }

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!AppError::Cancelled.is_retryable());
    }
}
