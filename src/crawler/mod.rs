//! HTTP crawling and cache warming.
//!
//! One `reqwest::Client` is built up front per worker with a timeout and a
//! fixed `User-Agent`, then reused across requests. Link extraction walks
//! the parsed document with `scraper::Html`/`Selector`. Two-phase warming,
//! cache-status normalisation, and the SSRF-safe resolver live in their own
//! submodules since each has enough surface area to test in isolation.

pub mod cache_status;
pub mod resolver;
pub mod timing;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::domain::{SecondFetch, TaskResponse, TaskTiming};
use crate::error::{AppError, HttpErrorKind, Result};
use resolver::ssrf_safe_resolver;

/// Content types worth scanning for `<a href>` links. Binary/media
/// responses are fetched (to warm the cache) but never parsed.
const LINK_EXTRACTABLE_TYPES: &[&str] = &["text/html", "application/xhtml+xml"];

const MAX_RETRY_AFTER_SECS: u64 = 120;

pub struct Crawler {
    client: Client,
    find_links: bool,
    second_fetch_delay: Duration,
}

impl Crawler {
    /// Build a crawler's HTTP client: SSRF-safe DNS resolution, a fixed
    /// per-worker `User-Agent`, no automatic decompression (so
    /// `content_length` reflects what the origin actually sent), and a
    /// request timeout from config.
    pub fn new(user_agent: &str, request_timeout: Duration, find_links: bool, second_fetch_delay: Duration) -> Result<Self> {
        // No gzip/brotli/deflate Cargo features are enabled, so reqwest
        // never transparently decompresses a response body — content_length
        // below reflects exactly what the origin sent.
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(request_timeout)
            .dns_resolver(ssrf_safe_resolver())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| AppError::http(HttpErrorKind::Permanent, e.to_string()))?;

        Ok(Self { client, find_links, second_fetch_delay })
    }

    /// The client this crawler dials pages with, exposed so the worker pool
    /// can reuse the same SSRF-safe connection path for ancillary fetches
    /// (robots.txt, for `Crawl-delay` rate limiting) instead of building a
    /// second client with separate safety checks.
    pub fn http_client(&self) -> &Client {
        &self.client
    }

    /// Fetch one URL, returning its normalised response plus any extracted
    /// links. On MISS/BYPASS cache status, performs a confirming second
    /// fetch after `second_fetch_delay` unless `cancel` fires first.
    pub async fn warm(
        &self,
        url: &Url,
        cancel: &tokio::sync::watch::Receiver<bool>,
    ) -> (TaskResponse, Option<SecondFetch>, Vec<Url>) {
        let (response, links) = self.fetch_once(url).await;

        let second_fetch = match response
            .cache_status
            .as_deref()
            .map(cache_status::classify)
        {
            Some(status) if status.warrants_second_fetch() => {
                self.wait_or_cancel(self.second_fetch_delay, cancel).await;
                if *cancel.borrow() {
                    None
                } else {
                    let (second, _) = self.fetch_once(url).await;
                    Some(SecondFetch {
                        status_code: second.status_code,
                        response_time_ms: second.response_time_ms,
                        cache_status: second.cache_status,
                    })
                }
            }
            _ => None,
        };

        (response, second_fetch, links)
    }

    async fn wait_or_cancel(&self, dur: Duration, cancel: &tokio::sync::watch::Receiver<bool>) {
        let mut cancel = cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = cancel.changed() => {}
        }
    }

    async fn fetch_once(&self, url: &Url) -> (TaskResponse, Vec<Url>) {
        let connection_timing = timing::probe(url).await;
        let start = Instant::now();
        let result = self.client.get(url.clone()).send().await;
        let ttfb_ms = elapsed_ms(start);

        match result {
            Ok(response) => self.handle_response(url, response, start, ttfb_ms, connection_timing).await,
            Err(e) => {
                warn!(%url, error = %e, "crawl request failed");
                (
                    TaskResponse {
                        error: Some(e.to_string()),
                        response_time_ms: Some(elapsed_ms(start)),
                        timing: TaskTiming {
                            dns_ms: connection_timing.dns_ms,
                            tcp_ms: connection_timing.tcp_ms,
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                    Vec::new(),
                )
            }
        }
    }

    async fn handle_response(
        &self,
        url: &Url,
        response: reqwest::Response,
        start: Instant,
        ttfb_ms: f64,
        connection_timing: timing::ConnectionTiming,
    ) -> (TaskResponse, Vec<Url>) {
        let status_code = response.status().as_u16() as i32;
        let cache_status = cache_status::normalise_cache_status(response.headers());
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let redirect_url = if response.url() != url {
            Some(response.url().to_string())
        } else {
            None
        };
        let headers = headers_to_json(response.headers());
        let retry_after = parse_retry_after(response.headers());

        if let Some(secs) = retry_after {
            debug!(%url, secs, "origin requested Retry-After, honouring before returning");
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }

        let should_extract = self.find_links
            && response.status().is_success()
            && is_link_extractable(content_type.as_deref());

        let body_start = Instant::now();
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(%url, error = %e, "failed reading response body");
                return (
                    TaskResponse {
                        status_code: Some(status_code),
                        response_time_ms: Some(elapsed_ms(start)),
                        cache_status: non_empty(cache_status),
                        content_type,
                        redirect_url,
                        headers: Some(headers),
                        error: Some(e.to_string()),
                        timing: TaskTiming {
                            dns_ms: connection_timing.dns_ms,
                            tcp_ms: connection_timing.tcp_ms,
                            ttfb_ms: Some(ttfb_ms),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                    Vec::new(),
                );
            }
        };
        let content_transfer_ms = elapsed_ms(body_start);

        let content_length = Some(body.len() as i64);

        let links = if should_extract {
            extract_links(&String::from_utf8_lossy(&body), url)
        } else {
            Vec::new()
        };

        let response_time_ms = elapsed_ms(start);
        (
            TaskResponse {
                status_code: Some(status_code),
                response_time_ms: Some(response_time_ms),
                cache_status: non_empty(cache_status),
                content_type,
                content_length,
                redirect_url,
                headers: Some(headers),
                timing: TaskTiming {
                    dns_ms: connection_timing.dns_ms,
                    tcp_ms: connection_timing.tcp_ms,
                    tls_ms: None,
                    ttfb_ms: Some(ttfb_ms),
                    content_transfer_ms: Some(content_transfer_ms),
                },
                error: None,
            },
            links,
        )
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn headers_to_json(headers: &reqwest::header::HeaderMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_string(), serde_json::Value::String(v.to_string()));
        }
    }
    serde_json::Value::Object(map)
}

/// Honour `Retry-After` as either a delta-seconds integer or an HTTP-date,
/// capped to avoid a hostile origin stalling a worker indefinitely.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let secs = if let Ok(n) = raw.trim().parse::<u64>() {
        n
    } else {
        // HTTP-date shares RFC 2822's grammar (RFC 9110 §5.6.7).
        let target = chrono::DateTime::parse_from_rfc2822(raw.trim()).ok()?;
        let now = chrono::Utc::now();
        (target.with_timezone(&chrono::Utc) - now).num_seconds().max(0) as u64
    };
    Some(secs.min(MAX_RETRY_AFTER_SECS))
}

fn is_link_extractable(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            let base = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            LINK_EXTRACTABLE_TYPES.contains(&base.as_str())
        }
        None => false,
    }
}

fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else { continue };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let Ok(mut resolved) = base.join(href) else { continue };
        resolved.set_fragment(None);
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        if resolved.host_str() != base.host_str() {
            continue;
        }
        if seen.insert(resolved.to_string()) {
            out.push(resolved);
        }
    }

    out
}

/// 2xx/3xx responses are successes for status-reporting purposes even
/// though `reqwest` follows redirects itself; kept for callers that need
/// to classify a raw status code without a `Response` in hand (batch
/// writer, tests).
pub fn is_success_status(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_extractable_types_match_html_family() {
        assert!(is_link_extractable(Some("text/html; charset=utf-8")));
        assert!(is_link_extractable(Some("application/xhtml+xml")));
        assert!(!is_link_extractable(Some("image/png")));
        assert!(!is_link_extractable(None));
    }

    #[test]
    fn extract_links_stays_same_host_and_strips_fragments() {
        let base = Url::parse("https://example.com/a/").unwrap();
        let html = r##"
            <a href="/b">b</a>
            <a href="https://example.com/c#section">c</a>
            <a href="https://other.com/d">d</a>
            <a href="mailto:x@example.com">mail</a>
            <a href="#top">top</a>
        "##;
        let links = extract_links(html, &base);
        let paths: Vec<&str> = links.iter().map(|u| u.path()).collect();
        assert!(paths.contains(&"/b"));
        assert!(paths.contains(&"/c"));
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn extract_links_deduplicates() {
        let base = Url::parse("https://example.com/").unwrap();
        let html = r#"<a href="/b">1</a><a href="/b">2</a>"#;
        let links = extract_links(html, &base);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn retry_after_numeric_seconds_is_parsed_and_capped() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "5".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(5));

        headers.insert(reqwest::header::RETRY_AFTER, "99999".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(MAX_RETRY_AFTER_SECS));
    }
}
