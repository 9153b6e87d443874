//! robots.txt fetching and rule evaluation.
//!
//! A plain `reqwest::Client` GET with a timeout fetches the body; a
//! line-oriented parser turns it into per-section disallow/allow/crawl-delay
//! rules, with a precedence chain that prefers an exact product match, then
//! falls back to a short list of peer crawlers, then the wildcard section.

use std::time::Duration;

use regex::Regex;
use url::Url;

/// Peer crawlers whose robots.txt section we'll fall back to if there is no
/// exact match for our own product name.
const PEER_CRAWLER_AGENTS: &[&str] = &[
    "screaming frog seo spider",
    "ahrefsbot",
    "semrushbot",
    "sitebulb",
    "rogerbot",
];

const MAX_ROBOTS_BODY_BYTES: usize = 1024 * 1024;
/// Generous enough for a slow origin without stalling job seeding.
const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsRules {
    pub crawl_delay_s: Option<f64>,
    pub disallow_patterns: Vec<String>,
    pub allow_patterns: Vec<String>,
    pub sitemaps: Vec<String>,
}

impl RobotsRules {
    /// True if `path` is disallowed for the matching section and not
    /// rescued by a more specific allow pattern.
    ///
    /// `Disallow: /` (block everything) is deliberately ignored: the
    /// presence of a robots.txt that bothers to publish sitemaps implies
    /// the site wants to be indexed, and a single overbroad disallow line
    /// shouldn't block a crawler that was explicitly invited in via a
    /// sitemap.
    pub fn is_allowed(&self, path: &str) -> bool {
        if self.allow_patterns.iter().any(|p| pattern_matches(p, path)) {
            return true;
        }
        let blocked = self
            .disallow_patterns
            .iter()
            .filter(|p| p.as_str() != "/")
            .any(|p| pattern_matches(p, path));
        !blocked
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let (body, anchored) = match pattern.strip_suffix('$') {
        Some(b) => (b, true),
        None => (pattern, false),
    };
    let escaped = regex::escape(body).replace(r"\*", ".*");
    let anchor = if anchored { "$" } else { "" };
    let re = match Regex::new(&format!("^{escaped}{anchor}")) {
        Ok(r) => r,
        Err(_) => return false,
    };
    re.is_match(path)
}

/// Parse a raw robots.txt body for the section applicable to our crawler.
///
/// Section precedence: (1) exact product-name match, (2) first
/// match among a fixed allow-list of peer SEO/site-audit crawlers, (3)
/// wildcard `*`. `Sitemap:` directives are global and collected regardless
/// of which section is selected.
pub fn parse_robots_txt(body: &str, product_name: &str) -> RobotsRules {
    let product_lower = product_name.to_ascii_lowercase();

    let mut sections: Vec<(String, RobotsRules)> = Vec::new();
    let mut sitemaps = Vec::new();
    let mut current: Option<usize> = None;

    for raw_line in body.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match key.as_str() {
            "user-agent" => {
                sections.push((value.to_ascii_lowercase(), RobotsRules::default()));
                current = Some(sections.len() - 1);
            }
            "disallow" => {
                if !value.is_empty() {
                    if let Some(idx) = current {
                        sections[idx].1.disallow_patterns.push(value.to_string());
                    }
                }
            }
            "allow" => {
                if !value.is_empty() {
                    if let Some(idx) = current {
                        sections[idx].1.allow_patterns.push(value.to_string());
                    }
                }
            }
            "crawl-delay" => {
                if let (Some(idx), Ok(secs)) = (current, value.parse::<f64>()) {
                    sections[idx].1.crawl_delay_s = Some(secs);
                }
            }
            "sitemap" => sitemaps.push(value.to_string()),
            // Legacy directives, intentionally parsed and discarded: we
            // don't throttle on a fixed visit schedule.
            "request-rate" | "visit-time" => {}
            _ => {}
        }
    }

    let mut selected = sections
        .iter()
        .find(|(agent, _)| agent == &product_lower)
        .map(|(_, rules)| rules.clone());

    if selected.is_none() {
        for peer in PEER_CRAWLER_AGENTS {
            if let Some((_, rules)) = sections.iter().find(|(agent, _)| agent == peer) {
                selected = Some(rules.clone());
                break;
            }
        }
    }

    if selected.is_none() {
        selected = sections
            .iter()
            .find(|(agent, _)| agent == "*")
            .map(|(_, rules)| rules.clone());
    }

    let mut rules = selected.unwrap_or_default();
    rules.sitemaps = sitemaps;
    rules
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Fetch and parse `https://<host>/robots.txt`. A 404 (or any non-success
/// status) yields empty rules rather than an error — robots.txt is
/// optional.
pub async fn fetch_robots(client: &reqwest::Client, host: &str, product_name: &str) -> RobotsRules {
    let Ok(url) = Url::parse(&format!("https://{host}/robots.txt")) else {
        return RobotsRules::default();
    };

    let response = match client.get(url).timeout(ROBOTS_FETCH_TIMEOUT).send().await {
        Ok(r) => r,
        Err(_) => return RobotsRules::default(),
    };

    if !response.status().is_success() {
        return RobotsRules::default();
    }

    let body = match response.bytes().await {
        Ok(b) => b,
        Err(_) => return RobotsRules::default(),
    };
    let capped = &body[..body.len().min(MAX_ROBOTS_BODY_BYTES)];
    let text = String::from_utf8_lossy(capped);
    parse_robots_txt(&text, product_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
User-agent: *
Disallow: /admin/
Allow: /admin/public/
Crawl-delay: 2

User-agent: CacheWarmerBot
Disallow: /private/

Sitemap: https://example.com/sitemap.xml
Sitemap: https://example.com/sitemap2.xml
"#;

    #[test]
    fn selects_exact_product_match_over_wildcard() {
        let rules = parse_robots_txt(SAMPLE, "CacheWarmerBot");
        assert_eq!(rules.disallow_patterns, vec!["/private/"]);
        assert!(rules.allow_patterns.is_empty());
    }

    #[test]
    fn falls_back_to_wildcard_when_no_product_match() {
        let rules = parse_robots_txt(SAMPLE, "SomeOtherBot");
        assert_eq!(rules.disallow_patterns, vec!["/admin/"]);
        assert_eq!(rules.crawl_delay_s, Some(2.0));
    }

    #[test]
    fn sitemaps_are_global_regardless_of_section() {
        let rules = parse_robots_txt(SAMPLE, "CacheWarmerBot");
        assert_eq!(
            rules.sitemaps,
            vec![
                "https://example.com/sitemap.xml".to_string(),
                "https://example.com/sitemap2.xml".to_string()
            ]
        );
    }

    #[test]
    fn allow_overrides_more_specific_disallow() {
        let rules = parse_robots_txt(SAMPLE, "SomeOtherBot");
        assert!(!rules.is_allowed("/admin/secret"));
        assert!(rules.is_allowed("/admin/public/page"));
    }

    #[test]
    fn disallow_everything_is_ignored() {
        let body = "User-agent: *\nDisallow: /\n";
        let rules = parse_robots_txt(body, "CacheWarmerBot");
        assert!(rules.is_allowed("/anything"));
    }

    #[test]
    fn wildcard_and_end_anchor_patterns() {
        let body = "User-agent: *\nDisallow: /*.pdf$\n";
        let rules = parse_robots_txt(body, "CacheWarmerBot");
        assert!(!rules.is_allowed("/doc/report.pdf"));
        assert!(rules.is_allowed("/doc/report.pdf.html"));
    }

    #[test]
    fn missing_robots_txt_yields_empty_rules() {
        let rules = RobotsRules::default();
        assert!(rules.is_allowed("/anything"));
    }
}
