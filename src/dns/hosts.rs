use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::DnsResolver;

/// HOSTS 静态域名映射解析器，未命中时委托内层解析器
pub struct HostsResolver {
    inner: Arc<dyn DnsResolver>,
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl HostsResolver {
    pub fn new(inner: Arc<dyn DnsResolver>, hosts: HashMap<String, Vec<IpAddr>>) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self { inner, hosts }
    }
}

#[async_trait]
impl DnsResolver for HostsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(addrs) = self.hosts.get(&host.to_lowercase()) {
            debug!(host = host, count = addrs.len(), "hosts table hit");
            return Ok(addrs.clone());
        }
        self.inner.resolve(host).await
    }

    async fn ip_to_host(&self, ip: IpAddr) -> Option<String> {
        self.inner.ip_to_host(ip).await
    }

    fn is_fake_ip(&self) -> bool {
        self.inner.is_fake_ip()
    }
}
