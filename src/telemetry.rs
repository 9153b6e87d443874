//! Logging setup.
//!
//! `tracing-subscriber` with an env-configurable filter, defaulting to
//! `info` with `sqlx` turned down to `warn` since its query logging at
//! `info` is noisy for a long-running service.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}
