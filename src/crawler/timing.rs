//! Best-effort connection-phase timing.
//!
//! `reqwest`'s public API doesn't expose per-phase connector timing (no hook
//! fires between DNS resolution, TCP connect, and the TLS handshake), so DNS
//! and TCP connect time are captured with a throwaway probe run immediately
//! before the real request: a separate resolve and connect to the same host,
//! timed and then dropped. TLS handshake timing would need the same
//! treatment directly against a TLS library, which this crate otherwise has
//! no reason to depend on, so `tls_ms` stays unmeasured.

use std::time::Instant;

use tokio::net::TcpStream;
use url::Url;

use crate::urlutil::is_private_or_local_ip;

/// DNS/TCP timing gathered ahead of the real fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionTiming {
    pub dns_ms: Option<f64>,
    pub tcp_ms: Option<f64>,
}

/// Resolve and connect to `url`'s host purely to time those two phases.
/// Never fails loudly: any error along the way just leaves the
/// corresponding field `None`, since this is diagnostic data, not something
/// the actual crawl should depend on.
pub async fn probe(url: &Url) -> ConnectionTiming {
    let Some(host) = url.host_str() else {
        return ConnectionTiming::default();
    };
    let port = url.port_or_known_default().unwrap_or(443);

    let dns_start = Instant::now();
    let addrs: Vec<_> = match tokio::net::lookup_host(format!("{host}:{port}")).await {
        Ok(a) => a.collect(),
        Err(_) => return ConnectionTiming::default(),
    };
    let dns_ms = dns_start.elapsed().as_secs_f64() * 1000.0;

    let Some(addr) = addrs.into_iter().find(|a| !is_private_or_local_ip(&a.ip())) else {
        return ConnectionTiming { dns_ms: Some(dns_ms), tcp_ms: None };
    };

    let tcp_start = Instant::now();
    let tcp_ms = TcpStream::connect(addr).await.ok().map(|_| tcp_start.elapsed().as_secs_f64() * 1000.0);

    ConnectionTiming { dns_ms: Some(dns_ms), tcp_ms }
}
