use std::collections::HashMap;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    /// direct | global | rule
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub ignore_resolve_fail: bool,
    #[serde(default)]
    pub dns: DnsConfig,
    pub geoip_db: Option<String>,
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default)]
    pub proxy_groups: Vec<ProxyGroupConfig>,
    /// 规则串，如 `DOMAIN-SUFFIX,example.com,PROXY`
    #[serde(default)]
    pub rules: Vec<String>,
}

impl Config {
    /// 结构层校验；规则语法与组依赖在装配时检查
    pub fn validate(&self) -> Result<()> {
        for outbound in &self.outbounds {
            if outbound.name.is_empty() {
                anyhow::bail!("outbound with empty name");
            }
        }
        for group in &self.proxy_groups {
            if group.proxies.is_empty() {
                anyhow::bail!("proxy group '{}' has no members", group.name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> String {
    "rule".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct DnsConfig {
    /// 上游 nameserver IP；缺省用系统解析
    pub server: Option<String>,
    /// 静态 hosts 映射：域名 → IP
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    /// fake-ip 池 CIDR，如 "198.18.0.0/16"
    pub fake_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutboundConfig {
    pub name: String,
    /// direct | reject | http | socks5
    pub protocol: String,
    #[serde(default)]
    pub settings: OutboundSettings,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutboundSettings {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyGroupConfig {
    pub name: String,
    /// selector | fallback | load-balance | relay
    #[serde(rename = "type")]
    pub group_type: String,
    pub proxies: Vec<String>,
    pub url: Option<String>,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    300
}
