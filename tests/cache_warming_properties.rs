//! Cross-module invariants that don't require a database.
//!
//! DB-backed scenarios (queue claiming under concurrency, batch-write
//! atomicity, stale-task recovery) are exercised by the `db_tests`
//! `#[cfg(test)]` modules next to `queue.rs`/`batch.rs`. Those tests read
//! `DATABASE_URL` and skip themselves (rather than fail) when it isn't set,
//! so they only run against a real Postgres; this file covers the pure,
//! always-runnable properties.

use cache_warmer::robots::parse_robots_txt;
use cache_warmer::sitemap;
use cache_warmer::urlutil::{is_private_or_local_ip, normalise_domain, normalise_path, validate_crawl_request};

#[test]
fn normalise_path_round_trip_is_idempotent_across_many_inputs() {
    let cases = [
        "https://example.com",
        "https://example.com/",
        "https://example.com/a",
        "https://example.com/a/",
        "/a/b/c/",
        "a/b",
    ];
    for raw in cases {
        let once = normalise_path(raw, "example.com").expect("first pass should normalise");
        let twice = normalise_path(&once, "example.com").expect("second pass should normalise");
        assert_eq!(once, twice, "normalise_path should be idempotent for {raw}");
    }
}

#[test]
fn crawl_request_validation_rejects_ssrf_favourite_schemes() {
    for bad in ["file:///etc/passwd", "ftp://example.com/x", "gopher://example.com"] {
        assert!(validate_crawl_request(bad).is_err(), "{bad} should be rejected");
    }
    assert!(validate_crawl_request("https://example.com/ok").is_ok());
}

#[test]
fn domain_normalisation_is_stable_under_scheme_and_case_variation() {
    let variants = [
        "https://Example.com",
        "http://www.example.com/",
        "EXAMPLE.COM",
        "example.com/path?query=1",
    ];
    for v in variants {
        assert_eq!(normalise_domain(v), "example.com", "failed for {v}");
    }
}

#[test]
fn private_ip_classification_covers_loopback_link_local_and_private_ranges() {
    let private = [
        "127.0.0.1", "10.1.2.3", "172.20.0.5", "192.168.0.9", "169.254.1.1", "100.64.0.1", "::1", "fd12::1",
        "fe80::abcd",
    ];
    for ip in private {
        let parsed = ip.parse().expect("valid ip literal");
        assert!(is_private_or_local_ip(&parsed), "{ip} should be classified private/local");
    }

    let public = ["8.8.8.8", "1.1.1.1", "2606:4700:4700::1111"];
    for ip in public {
        let parsed = ip.parse().expect("valid ip literal");
        assert!(!is_private_or_local_ip(&parsed), "{ip} should be classified public");
    }
}

#[test]
fn robots_precedence_chain_exact_then_peer_then_wildcard() {
    let body = r#"
User-agent: *
Disallow: /everyone/

User-agent: ahrefsbot
Disallow: /peer-only/

User-agent: CacheWarmerBot
Disallow: /exact/
"#;
    let exact = parse_robots_txt(body, "CacheWarmerBot");
    assert!(!exact.is_allowed("/exact/page"));
    assert!(exact.is_allowed("/everyone/page"));

    let peer_fallback = parse_robots_txt(body, "UnknownBot");
    // UnknownBot isn't a recognised peer crawler, so it falls straight to
    // the wildcard section.
    assert!(!peer_fallback.is_allowed("/everyone/page"));
}

#[tokio::test]
async fn sitemap_index_depth_limit_stops_recursion_without_panicking() {
    // A sitemap that points at itself would recurse forever without the
    // depth cap; parsing in isolation (no network) exercises the XML
    // layer's kind-detection without needing the cap itself to be hit.
    let xml = r#"<sitemapindex><sitemap><loc>https://example.com/a.xml</loc></sitemap></sitemapindex>"#;
    let client = reqwest::Client::new();
    // fetch_and_parse_sitemap requires a reachable URL; here we only assert
    // that parsing malformed/unreachable input degrades to an empty result
    // rather than panicking.
    let bogus = url::Url::parse("https://127.0.0.1.invalid/sitemap.xml").unwrap();
    let result = sitemap::fetch_and_parse_sitemap(&client, &bogus).await;
    assert!(result.is_empty());
    let _ = xml;
}
