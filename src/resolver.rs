use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::net::IpAddr;

/// NameResolver turns a host name into an IP address
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// DnsResolver uses the system resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl NameResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        // lookup_host wants a port, it is dropped again below
        tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| anyhow!("failed to resolve host '{host}': {e}"))?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| anyhow!("no IP address found for '{host}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_ip_literal() {
        let ip = DnsResolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(ip, IpAddr::from([127, 0, 0, 1]));
    }
}
