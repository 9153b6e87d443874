//! Sitemap discovery and parsing.
//!
//! A `quick_xml::Reader::read_event_into` loop walks `<url>`/`<loc>` and
//! `<sitemapindex>` entries, recursing into index files up to a fixed
//! depth. Discovery falls back to a HEAD probe against well-known paths
//! when a domain doesn't advertise its sitemap location.

use std::time::Duration;

use quick_xml::events::Event;
use tracing::warn;
use url::Url;

use crate::urlutil::validate_crawl_request;

const DEFAULT_SITEMAP_PATHS: &[&str] = &["/sitemap.xml", "/sitemap_index.xml"];
const MAX_SITEMAP_INDEX_DEPTH: u32 = 3;
const SITEMAP_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    Index,
    UrlSet,
}

/// Discover candidate sitemap URLs: start from robots-declared sitemaps; if
/// none, probe the default locations with HEAD requests. Always
/// deduplicated.
pub async fn discover_sitemaps(
    client: &reqwest::Client,
    base: &Url,
    robots_sitemaps: &[String],
) -> Vec<Url> {
    let mut found = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for raw in robots_sitemaps {
        if let Ok(url) = Url::parse(raw) {
            if seen.insert(url.to_string()) {
                found.push(url);
            }
        }
    }

    if found.is_empty() {
        for path in DEFAULT_SITEMAP_PATHS {
            let Ok(url) = base.join(path) else { continue };
            let ok = client
                .head(url.clone())
                .timeout(SITEMAP_FETCH_TIMEOUT)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if ok && seen.insert(url.to_string()) {
                found.push(url);
            }
        }
    }

    found
}

/// Fetch and recursively parse a sitemap (or sitemap index), returning the
/// validated leaf URLs. Fetch failures of nested sitemaps are logged as
/// warnings and otherwise ignored — a broken child sitemap doesn't fail the
/// whole job.
pub async fn fetch_and_parse_sitemap(client: &reqwest::Client, url: &Url) -> Vec<Url> {
    let mut out = Vec::new();
    fetch_and_parse_inner(client, url, 0, &mut out).await;
    out
}

fn fetch_and_parse_inner<'a>(
    client: &'a reqwest::Client,
    url: &'a Url,
    depth: u32,
    out: &'a mut Vec<Url>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_SITEMAP_INDEX_DEPTH {
            warn!(%url, depth, "sitemap index nesting too deep, stopping");
            return;
        }

        let body = match client.get(url.clone()).timeout(SITEMAP_FETCH_TIMEOUT).send().await {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!(%url, error = %e, "failed to read sitemap body");
                    return;
                }
            },
            Err(e) => {
                warn!(%url, error = %e, "failed to fetch sitemap");
                return;
            }
        };

        let (kind, entries) = parse_sitemap_xml(&body);
        match kind {
            Kind::Index => {
                for entry in entries {
                    let Ok(child_url) = Url::parse(&entry) else {
                        warn!(entry, "invalid child sitemap URL, skipping");
                        continue;
                    };
                    fetch_and_parse_inner(client, &child_url, depth + 1, out).await;
                }
            }
            Kind::UrlSet => {
                for entry in entries {
                    match validate_crawl_request(&entry) {
                        Ok(valid) => out.push(valid),
                        Err(e) => warn!(entry, error = %e, "dropping invalid sitemap URL"),
                    }
                }
            }
        }
    })
}

/// Parse sitemap XML, distinguishing a `<sitemapindex>` (returns child
/// sitemap URLs) from a plain urlset (returns page URLs).
fn parse_sitemap_xml(text: &str) -> (Kind, Vec<String>) {
    let mut reader = quick_xml::Reader::from_str(text);
    let mut buf = Vec::new();
    let mut urls = Vec::new();
    let mut in_loc = false;
    let mut kind = Kind::UrlSet;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"loc" => in_loc = true,
                b"sitemapindex" => kind = Kind::Index,
                _ => {}
            },
            Ok(Event::Text(e)) if in_loc => {
                match e.decode() {
                    Ok(txt) => urls.push(txt.trim().to_string()),
                    Err(e) => warn!(error = %e, "invalid sitemap <loc> text, skipping entry"),
                }
                in_loc = false;
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"loc" => in_loc = false,
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(error = %e, "malformed sitemap XML, stopping parse");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    (kind, urls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_urlset() {
        let xml = r#"<?xml version="1.0"?>
        <urlset><url><loc>https://example.com/a</loc></url>
        <url><loc>https://example.com/b</loc></url></urlset>"#;
        let (kind, urls) = parse_sitemap_xml(xml);
        assert_eq!(kind, Kind::UrlSet);
        assert_eq!(urls, vec!["https://example.com/a", "https://example.com/b"]);
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = r#"<sitemapindex>
        <sitemap><loc>https://example.com/sitemap-a.xml</loc></sitemap>
        <sitemap><loc>https://example.com/sitemap-b.xml</loc></sitemap>
        </sitemapindex>"#;
        let (kind, urls) = parse_sitemap_xml(xml);
        assert_eq!(kind, Kind::Index);
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn empty_input_yields_no_urls() {
        let (_, urls) = parse_sitemap_xml("");
        assert!(urls.is_empty());
    }

    #[test]
    fn invalid_utf8_loc_is_skipped_not_fatal() {
        let xml = "<urlset><url><loc>https://example.com/ok</loc></url></urlset>";
        let (_, urls) = parse_sitemap_xml(xml);
        assert_eq!(urls, vec!["https://example.com/ok"]);
    }
}
