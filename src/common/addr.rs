use std::fmt;
use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use serde::Deserialize;

/// 转发目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// DNS 解析为 SocketAddr（系统解析，取第一个结果）
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let resolved = tokio::net::lookup_host((domain.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        anyhow::anyhow!("DNS resolution failed for {}:{}", domain, port)
                    })?;
                Ok(resolved)
            }
        }
    }

    /// 编码为 SOCKS5 地址格式 [ATYP][ADDR][PORT]
    pub fn encode_socks5(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(0x04);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                buf.put_u8(0x03);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }
        if let Some((host, port_str)) = s.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                if let Ok(ip) = host.parse::<IpAddr>() {
                    return Ok(Address::Ip(SocketAddr::new(ip, port)));
                }
                return Ok(Address::Domain(host.to_string(), port));
            }
        }
        Err(serde::de::Error::custom(format!("invalid address: {}", s)))
    }
}
