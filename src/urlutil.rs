//! URL and IP-address utilities.
//!
//! Domain/path normalisation plus a private/local IP classifier
//! (`is_private_or_local_ip`) covering IPv4 loopback/link-local/private
//! ranges and their IPv6 equivalents, used to reject SSRF-favourite
//! targets before a request ever goes out.

use crate::error::AppError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

/// Strip scheme, strip a leading `www.`, trim a trailing `/`, lower-case.
pub fn normalise_domain(s: &str) -> String {
    let without_scheme = s
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(s);
    let without_path = without_scheme.split(['/', '?', '#']).next().unwrap_or("");
    let lower = without_path.to_ascii_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}

/// Normalise a (possibly relative) URL to a path within `default_domain`.
/// Root normalises to `"/"`; otherwise a leading slash with no trailing
/// slash.
pub fn normalise_path(raw_url: &str, default_domain: &str) -> crate::error::Result<String> {
    let base = format!("https://{}", normalise_domain(default_domain));
    let base_url =
        Url::parse(&base).map_err(|e| AppError::InvalidUrl(format!("{default_domain}: {e}")))?;

    let parsed = match Url::parse(raw_url) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => base_url
            .join(raw_url)
            .map_err(|e| AppError::InvalidUrl(format!("{raw_url}: {e}")))?,
        Err(e) => return Err(AppError::InvalidUrl(format!("{raw_url}: {e}"))),
    };

    let path = parsed.path();
    if path.is_empty() || path == "/" {
        return Ok("/".to_string());
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// Validate a URL as a crawlable target: `http`/`https` scheme, non-empty
/// host.
pub fn validate_crawl_request(raw_url: &str) -> crate::error::Result<Url> {
    let parsed = Url::parse(raw_url).map_err(|e| AppError::InvalidUrl(format!("{raw_url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(AppError::InvalidUrl(format!("unsupported scheme: {other}"))),
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(AppError::InvalidUrl(format!("missing host: {raw_url}")));
    }
    Ok(parsed)
}

/// True for loopback, link-local, RFC1918, unspecified, and IPv6
/// equivalents.
pub fn is_private_or_local_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_or_local_ipv4(v4),
        IpAddr::V6(v6) => is_private_or_local_ipv6(v6),
    }
}

fn is_private_or_local_ipv4(v4: &Ipv4Addr) -> bool {
    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT, commonly abused for SSRF pivots.
        || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
}

fn is_private_or_local_ipv6(v6: &Ipv6Addr) -> bool {
    if v6.is_loopback() || v6.is_unspecified() {
        return true;
    }
    if let Some(v4) = v6.to_ipv4_mapped() {
        return is_private_or_local_ipv4(&v4);
    }
    let segments = v6.segments();
    // fe80::/10 link-local.
    let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
    // fc00::/7 unique local.
    let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
    is_link_local || is_unique_local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_scheme_www_and_trailing_slash() {
        assert_eq!(normalise_domain("https://www.Example.com/"), "example.com");
        assert_eq!(normalise_domain("http://example.com"), "example.com");
        assert_eq!(normalise_domain("EXAMPLE.COM"), "example.com");
    }

    #[test]
    fn normalise_path_root_is_slash() {
        assert_eq!(normalise_path("https://example.com", "example.com").unwrap(), "/");
        assert_eq!(normalise_path("https://example.com/", "example.com").unwrap(), "/");
    }

    #[test]
    fn normalise_path_resolves_relative_against_default_domain() {
        assert_eq!(normalise_path("/a/b/", "example.com").unwrap(), "/a/b");
        assert_eq!(normalise_path("a/b", "example.com").unwrap(), "/a/b");
    }

    #[test]
    fn normalise_path_is_idempotent() {
        let once = normalise_path("https://example.com/a/b/", "example.com").unwrap();
        let twice = normalise_path(&once, "example.com").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn validate_crawl_request_rejects_bad_scheme() {
        assert!(validate_crawl_request("ftp://example.com").is_err());
        assert!(validate_crawl_request("not a url").is_err());
        assert!(validate_crawl_request("https://example.com/page").is_ok());
    }

    #[test]
    fn validate_crawl_request_rejects_empty_host() {
        assert!(validate_crawl_request("file:///etc/passwd").is_err());
    }

    #[test]
    fn private_ipv4_ranges_are_blocked() {
        for s in ["127.0.0.1", "10.0.0.1", "172.16.0.1", "192.168.1.1", "169.254.1.1", "0.0.0.0", "100.64.0.1"] {
            let ip: IpAddr = s.parse().unwrap();
            assert!(is_private_or_local_ip(&ip), "{s} should be blocked");
        }
    }

    #[test]
    fn public_ipv4_is_allowed() {
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(!is_private_or_local_ip(&ip));
    }

    #[test]
    fn ipv6_loopback_and_unique_local_are_blocked() {
        let loopback: IpAddr = "::1".parse().unwrap();
        let unique_local: IpAddr = "fd00::1".parse().unwrap();
        let link_local: IpAddr = "fe80::1".parse().unwrap();
        assert!(is_private_or_local_ip(&loopback));
        assert!(is_private_or_local_ip(&unique_local));
        assert!(is_private_or_local_ip(&link_local));
    }

    #[test]
    fn ipv6_public_is_allowed() {
        let ip: IpAddr = "2606:4700:4700::1111".parse().unwrap();
        assert!(!is_private_or_local_ip(&ip));
    }
}
