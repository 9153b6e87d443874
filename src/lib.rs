//! Cache-warming job engine: enumerates a site's URLs, crawls them with
//! controlled concurrency, and classifies CDN cache status so callers can
//! tell which pages are actually primed at the edge.

pub mod batch;
pub mod config;
pub mod crawler;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod pool;
pub mod queue;
pub mod resilience;
pub mod robots;
pub mod scheduler;
pub mod sitemap;
pub mod store;
pub mod telemetry;
pub mod urlutil;
