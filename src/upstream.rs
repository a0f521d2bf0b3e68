//! Process-wide HTTP client for talking to the upstream chat API.
//!
//! The operator typically points the proxy's own hostname at the machine's
//! `/etc/hosts` so the client's existing base URL routes to us instead of
//! the real upstream. To reach the real upstream ourselves we resolve its
//! hostname against an external DNS server and pin the connection to that
//! IP, while still presenting the real hostname as the TLS SNI and `Host`
//! header — otherwise we'd just be proxying to ourselves.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

const EXTERNAL_DNS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];
const FORWARD_TIMEOUT_SECS: u64 = 600;
const CHECKPOINT_TIMEOUT_SECS: u64 = 120;
const PASSTHROUGH_TIMEOUT_SECS: u64 = 120;

/// Resolve `host` against external DNS servers, bypassing any local
/// `/etc/hosts` override that points it at the proxy itself.
pub async fn resolve_externally(host: &str) -> anyhow::Result<IpAddr> {
    let name_servers = NameServerConfigGroup::from_ips_clear(
        &EXTERNAL_DNS
            .iter()
            .map(|ip| ip.parse().unwrap())
            .collect::<Vec<IpAddr>>(),
        53,
        true,
    );
    let config = ResolverConfig::from_parts(None, vec![], name_servers);
    let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
    let response = resolver.lookup_ip(host).await?;
    response
        .iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no DNS records for {host}"))
}

/// Build the process-wide client used for all upstream calls. `upstream_host`
/// and its externally-resolved IP are pinned at construction time so every
/// request using this client dials the real upstream regardless of what the
/// local resolver (and its possibly-hijacked hosts file) would say.
pub fn build_client(upstream_host: &str, upstream_port: u16, resolved_ip: IpAddr) -> anyhow::Result<reqwest::Client> {
    let addr = SocketAddr::new(resolved_ip, upstream_port);
    let client = reqwest::Client::builder()
        .resolve(upstream_host, addr)
        .timeout(Duration::from_secs(FORWARD_TIMEOUT_SECS))
        .build()?;
    Ok(client)
}

pub fn checkpoint_timeout() -> Duration {
    Duration::from_secs(CHECKPOINT_TIMEOUT_SECS)
}

pub fn passthrough_timeout() -> Duration {
    Duration::from_secs(PASSTHROUGH_TIMEOUT_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_match_documented_values() {
        assert_eq!(checkpoint_timeout(), Duration::from_secs(120));
        assert_eq!(passthrough_timeout(), Duration::from_secs(120));
    }
}
