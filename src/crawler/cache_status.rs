//! CDN cache-status header normalisation.
//!
//! A pure function over header values: same input always yields the same
//! output, comparison is case-insensitive with surrounding whitespace
//! trimmed. No HTTP/IO here so it is cheap to exhaustively unit-test.

use reqwest::header::HeaderMap;

use crate::domain::CacheStatus;

const CLOSED_VOCAB: &[&str] = &[
    "HIT", "MISS", "DYNAMIC", "BYPASS", "EXPIRED", "STALE", "REVALIDATED", "UPDATING",
    "PRERENDER", "PASS",
];

/// Normalise whichever vendor cache-status header is present into the
/// closed vocabulary, or pass the raw value through untouched if it isn't
/// one this engine recognises. Returns `""` if no relevant header is
/// present at all.
pub fn normalise_cache_status(headers: &HeaderMap) -> String {
    if let Some(v) = header_str(headers, "cf-cache-status") {
        return to_vocab_or_passthrough(&v);
    }
    if let Some(v) = header_str(headers, "x-vercel-cache") {
        return to_vocab_or_passthrough(&v);
    }
    if let Some(v) = header_str(headers, "cache-status") {
        return normalise_rfc9211(&v);
    }
    if let Some(v) = header_str(headers, "x-varnish") {
        return normalise_varnish(&v);
    }
    // X-Cache is used by both CloudFront and Akamai/Azure with different
    // vocabularies, and by Fastly with a shielding-aware comma list.
    if let Some(v) = header_str(headers, "x-cache").or_else(|| header_str(headers, "x-cache-remote")) {
        return normalise_x_cache(&v);
    }
    String::new()
}

/// Classify a normalised status string into the closed enum, for callers
/// (two-phase warming) that only need to branch on the vocabulary, not
/// display the raw value.
pub fn classify(normalised: &str) -> CacheStatus {
    match normalised.to_ascii_uppercase().as_str() {
        "HIT" => CacheStatus::Hit,
        "MISS" => CacheStatus::Miss,
        "DYNAMIC" => CacheStatus::Dynamic,
        "BYPASS" => CacheStatus::Bypass,
        "EXPIRED" => CacheStatus::Expired,
        "STALE" => CacheStatus::Stale,
        "REVALIDATED" => CacheStatus::Revalidated,
        "UPDATING" => CacheStatus::Updating,
        "PRERENDER" => CacheStatus::Prerender,
        "PASS" => CacheStatus::Pass,
        _ => CacheStatus::Unknown,
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn to_vocab_or_passthrough(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    if CLOSED_VOCAB.contains(&upper.as_str()) {
        upper
    } else {
        raw.trim().to_string()
    }
}

fn normalise_x_cache(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();

    // Fastly shielding: comma-separated hop results, e.g. "MISS, HIT" — a
    // hit anywhere in the chain counts as a HIT on the edge.
    if lower.contains(',') {
        let tokens: Vec<&str> = lower.split(',').map(str::trim).collect();
        if tokens.iter().any(|t| *t == "hit") {
            return "HIT".to_string();
        }
        if tokens.iter().any(|t| *t == "miss") {
            return "MISS".to_string();
        }
    }

    // CloudFront.
    if lower.contains("lambdageneratedresponse") {
        return "DYNAMIC".to_string();
    }
    if lower.contains("refreshhit") {
        return "REVALIDATED".to_string();
    }
    if lower.contains("hit from cloudfront") {
        return "HIT".to_string();
    }
    if lower.contains("miss from cloudfront") {
        return "MISS".to_string();
    }

    // Akamai / Azure.
    match lower.as_str() {
        "tcp_hit" | "tcp_mem_hit" => return "HIT".to_string(),
        "tcp_miss" => return "MISS".to_string(),
        "tcp_refresh_hit" => return "REVALIDATED".to_string(),
        "tcp_denied" => return "BYPASS".to_string(),
        "uncacheable" => return "DYNAMIC".to_string(),
        _ => {}
    }

    raw.trim().to_string()
}

fn normalise_rfc9211(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    for token in lower.split(';').map(str::trim) {
        if token == "hit" {
            return "HIT".to_string();
        }
        if let Some(reason) = token.strip_prefix("fwd=") {
            return match reason {
                "stale" => "STALE".to_string(),
                "bypass" => "BYPASS".to_string(),
                _ => "MISS".to_string(),
            };
        }
    }
    raw.trim().to_string()
}

fn normalise_varnish(raw: &str) -> String {
    let ids: Vec<&str> = raw.split_whitespace().collect();
    if ids.len() <= 1 {
        "MISS".to_string()
    } else {
        "HIT".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(HeaderName::from_bytes(k.as_bytes()).unwrap(), HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn cloudflare_passes_through_closed_vocab_values() {
        let h = headers(&[("cf-cache-status", " hit ")]);
        assert_eq!(normalise_cache_status(&h), "HIT");
    }

    #[test]
    fn cloudfront_hit_miss_and_refresh() {
        assert_eq!(normalise_x_cache("Hit from cloudfront"), "HIT");
        assert_eq!(normalise_x_cache("Miss from cloudfront"), "MISS");
        assert_eq!(normalise_x_cache("RefreshHit from cloudfront"), "REVALIDATED");
        assert_eq!(normalise_x_cache("LambdaGeneratedResponse"), "DYNAMIC");
    }

    #[test]
    fn akamai_azure_tokens() {
        assert_eq!(normalise_x_cache("TCP_HIT"), "HIT");
        assert_eq!(normalise_x_cache("TCP_MEM_HIT"), "HIT");
        assert_eq!(normalise_x_cache("TCP_MISS"), "MISS");
        assert_eq!(normalise_x_cache("TCP_REFRESH_HIT"), "REVALIDATED");
        assert_eq!(normalise_x_cache("TCP_DENIED"), "BYPASS");
        assert_eq!(normalise_x_cache("UNCACHEABLE"), "DYNAMIC");
    }

    #[test]
    fn fastly_shielding_prefers_hit_anywhere_in_chain() {
        assert_eq!(normalise_x_cache("MISS, HIT"), "HIT");
        assert_eq!(normalise_x_cache("MISS, MISS"), "MISS");
    }

    #[test]
    fn vercel_passthrough() {
        let h = headers(&[("x-vercel-cache", "STALE")]);
        assert_eq!(normalise_cache_status(&h), "STALE");
    }

    #[test]
    fn rfc9211_hit_and_forward_reasons() {
        assert_eq!(normalise_rfc9211("ExampleCache; hit"), "HIT");
        assert_eq!(normalise_rfc9211("ExampleCache; fwd=miss"), "MISS");
        assert_eq!(normalise_rfc9211("ExampleCache; fwd=stale"), "STALE");
        assert_eq!(normalise_rfc9211("ExampleCache; fwd=bypass"), "BYPASS");
    }

    #[test]
    fn varnish_single_vs_multiple_ids() {
        assert_eq!(normalise_varnish("1234567"), "MISS");
        assert_eq!(normalise_varnish("1234567 7654321"), "HIT");
    }

    #[test]
    fn unknown_vendor_value_passes_through_untouched() {
        let h = headers(&[("x-cache", "SOME-WEIRD-VALUE")]);
        assert_eq!(normalise_cache_status(&h), "SOME-WEIRD-VALUE");
    }

    #[test]
    fn is_pure_case_and_whitespace_insensitive() {
        let a = headers(&[("cf-cache-status", "hit")]);
        let b = headers(&[("cf-cache-status", "  HIT  ")]);
        assert_eq!(normalise_cache_status(&a), normalise_cache_status(&b));
    }

    #[test]
    fn no_relevant_header_yields_empty_string() {
        let h = headers(&[]);
        assert_eq!(normalise_cache_status(&h), "");
        assert_eq!(classify(""), CacheStatus::Unknown);
    }
}
