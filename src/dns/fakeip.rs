use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::RwLock;
use tracing::debug;

use super::DnsResolver;

/// FakeIP 解析器：为每个域名分配池内虚拟 IP，维护反向映射。
///
/// The synthetic IP defers real resolution until egress: the tunnel maps
/// it back to the domain before matching, and the chosen outbound
/// resolves the domain itself.
pub struct FakeIpResolver {
    base: u32,
    size: u32,
    offset: AtomicU32,
    domain_to_ip: RwLock<HashMap<String, Ipv4Addr>>,
    ip_to_domain: RwLock<HashMap<Ipv4Addr, String>>,
}

impl FakeIpResolver {
    /// `cidr` 形如 "198.18.0.0/16"
    pub fn new(cidr: &str) -> Result<Self> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid fake-ip cidr: {}", cidr))?;
        let size = 2u32.saturating_pow(32 - net.prefix_len() as u32);
        if size < 4 {
            anyhow::bail!("fake-ip pool '{}' too small", cidr);
        }
        Ok(Self {
            base: u32::from(net.network()),
            size,
            // 跳过网络地址
            offset: AtomicU32::new(1),
            domain_to_ip: RwLock::new(HashMap::new()),
            ip_to_domain: RwLock::new(HashMap::new()),
        })
    }

    /// 为域名分配（或复用）一个虚拟 IP
    pub async fn allocate(&self, domain: &str) -> Ipv4Addr {
        let domain = domain.to_lowercase();
        {
            let map = self.domain_to_ip.read().await;
            if let Some(&ip) = map.get(&domain) {
                return ip;
            }
        }

        let offset = self.offset.fetch_add(1, Ordering::Relaxed) % self.size;
        let ip = Ipv4Addr::from(self.base.wrapping_add(offset));

        let mut d2i = self.domain_to_ip.write().await;
        let mut i2d = self.ip_to_domain.write().await;
        if let Some(&existing) = d2i.get(&domain) {
            return existing;
        }
        // 池环绕时回收旧映射
        if let Some(old) = i2d.remove(&ip) {
            d2i.remove(&old);
        }
        d2i.insert(domain.clone(), ip);
        i2d.insert(ip, domain.clone());
        debug!(domain = domain, ip = %ip, "fake-ip allocated");
        ip
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                let v = u32::from(v4);
                v.wrapping_sub(self.base) < self.size
            }
            IpAddr::V6(_) => false,
        }
    }
}

#[async_trait]
impl DnsResolver for FakeIpResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let ip = self.allocate(host).await;
        Ok(vec![IpAddr::V4(ip)])
    }

    async fn ip_to_host(&self, ip: IpAddr) -> Option<String> {
        let IpAddr::V4(v4) = ip else { return None };
        self.ip_to_domain.read().await.get(&v4).cloned()
    }

    fn is_fake_ip(&self) -> bool {
        true
    }
}
