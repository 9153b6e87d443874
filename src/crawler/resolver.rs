//! Connect-time SSRF defence.
//!
//! URL-time host validation alone is insufficient: a host can resolve to a
//! public IP during validation and a private one by the time reqwest opens
//! the TCP connection (DNS rebinding). This resolver plugs into reqwest's
//! connector via `reqwest::dns::Resolve`, so every address reqwest actually
//! dials has been checked immediately before the connect — there's no gap
//! an attacker can race.

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::net::lookup_host;

use crate::error::AppError;
use crate::urlutil::is_private_or_local_ip;

/// `reqwest::dns::Resolve` implementation that filters out any resolved
/// address in a private/local range before handing the list back to
/// reqwest's connector.
#[derive(Debug, Clone, Default)]
pub struct SsrfSafeResolver;

impl Resolve for SsrfSafeResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let lookup_target = format!("{host}:0");

            let addrs: Vec<SocketAddr> = lookup_host(lookup_target)
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?
                .collect();

            let safe: Vec<SocketAddr> = addrs
                .into_iter()
                .filter(|addr| !is_private_or_local_ip(&addr.ip()))
                .collect();

            if safe.is_empty() {
                return Err(Box::new(AppError::Ssrf { host }) as Box<dyn std::error::Error + Send + Sync>);
            }

            let iter: Addrs = Box::new(safe.into_iter());
            Ok(iter)
        })
    }
}

/// Build the shared resolver instance used by every crawler HTTP client.
pub fn ssrf_safe_resolver() -> Arc<SsrfSafeResolver> {
    Arc::new(SsrfSafeResolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[test]
    fn filters_private_addresses_out_of_a_mixed_set() {
        let addrs = vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 0),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 0),
        ];
        let safe: Vec<_> = addrs
            .into_iter()
            .filter(|a| !is_private_or_local_ip(&a.ip()))
            .collect();
        assert_eq!(safe.len(), 1);
        assert_eq!(safe[0].ip(), IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
    }
}
