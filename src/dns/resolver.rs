use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, info};

use super::DnsResolver;

/// 系统 DNS 解析器（使用 tokio::net::lookup_host）
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0u16))
            .await?
            .map(|a| a.ip())
            .collect();
        if addrs.is_empty() {
            anyhow::bail!("DNS resolution failed: no addresses for {}", host);
        }
        debug!(host = host, count = addrs.len(), "system DNS resolved");
        Ok(addrs)
    }
}

/// 指定上游 nameserver 的解析器（hickory，UDP 53）
pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn new(address: &str) -> Result<Self> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid DNS server address: {}", address))?;
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(ip, 53),
            Protocol::Udp,
        ));
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        info!(address = address, "upstream DNS resolver created");
        Ok(Self { resolver })
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let response = self.resolver.lookup_ip(host).await?;
        let addrs: Vec<IpAddr> = response.iter().collect();
        if addrs.is_empty() {
            anyhow::bail!("DNS resolution failed: no addresses for {}", host);
        }
        debug!(host = host, count = addrs.len(), "upstream DNS resolved");
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_resolver_resolves_localhost() {
        let resolver = SystemResolver;
        let addrs = resolver.resolve("localhost").await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().any(|a| a.is_loopback()));
    }

    #[test]
    fn hickory_rejects_bad_address() {
        assert!(HickoryResolver::new("not-an-ip").is_err());
    }
}
