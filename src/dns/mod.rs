pub mod fakeip;
pub mod hosts;
pub mod resolver;

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;

pub use fakeip::FakeIpResolver;
pub use hosts::HostsResolver;
pub use resolver::{HickoryResolver, SystemResolver};

/// DNS 解析器 trait
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// 将域名解析为 IP 地址列表
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;

    async fn resolve_v4(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = self
            .resolve(host)
            .await?
            .into_iter()
            .filter(|ip| ip.is_ipv4())
            .collect();
        if addrs.is_empty() {
            anyhow::bail!("no IPv4 addresses for {}", host);
        }
        Ok(addrs)
    }

    async fn resolve_v6(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = self
            .resolve(host)
            .await?
            .into_iter()
            .filter(|ip| ip.is_ipv6())
            .collect();
        if addrs.is_empty() {
            anyhow::bail!("no IPv6 addresses for {}", host);
        }
        Ok(addrs)
    }

    /// 反查 IP 对应的域名（fake-ip 池命中时返回）
    async fn ip_to_host(&self, _ip: IpAddr) -> Option<String> {
        None
    }

    /// 该解析器分配的 IP 是否为虚拟 IP（不可直接拨号）
    fn is_fake_ip(&self) -> bool {
        false
    }
}
