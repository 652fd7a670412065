pub mod geoip;
pub mod process;

use std::fmt;
use std::net::IpAddr;

use anyhow::Result;
use ipnet::IpNet;

use crate::common::RouteError;
use crate::proxy::{Metadata, Network};

pub use geoip::GeoIpDb;

const NO_RESOLVE: &str = "no-resolve";

/// 单个匹配谓词
#[derive(Debug, Clone)]
pub enum RuleUnit {
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    GeoIp(String),
    IpCidr { net: IpNet, source: bool },
    Port { port: u16, source: bool },
    Proto(Network),
    Process(String),
    Match,
}

impl RuleUnit {
    /// 识别规则类型并解析载荷；未知类型返回 None
    fn parse(kind: &str, payload: &str) -> Result<Option<RuleUnit>, String> {
        let unit = match kind {
            "DOMAIN" => RuleUnit::Domain(payload.to_lowercase()),
            "DOMAIN-SUFFIX" => RuleUnit::DomainSuffix(payload.to_lowercase()),
            "DOMAIN-KEYWORD" => RuleUnit::DomainKeyword(payload.to_lowercase()),
            "GEOIP" => RuleUnit::GeoIp(payload.to_uppercase()),
            "IP-CIDR" | "IP-CIDR6" => RuleUnit::IpCidr {
                net: payload
                    .parse()
                    .map_err(|_| format!("invalid CIDR '{}'", payload))?,
                source: false,
            },
            "SRC-IP-CIDR" => RuleUnit::IpCidr {
                net: payload
                    .parse()
                    .map_err(|_| format!("invalid CIDR '{}'", payload))?,
                source: true,
            },
            "SRC-PORT" => RuleUnit::Port {
                port: payload
                    .parse()
                    .map_err(|_| format!("invalid port '{}'", payload))?,
                source: true,
            },
            "DST-PORT" => RuleUnit::Port {
                port: payload
                    .parse()
                    .map_err(|_| format!("invalid port '{}'", payload))?,
                source: false,
            },
            "PROTO" => match payload.to_lowercase().as_str() {
                "tcp" => RuleUnit::Proto(Network::Tcp),
                "udp" => RuleUnit::Proto(Network::Udp),
                other => return Err(format!("unknown protocol '{}'", other)),
            },
            "PROCESS-NAME" => RuleUnit::Process(payload.to_string()),
            _ => return Ok(None),
        };
        Ok(Some(unit))
    }

    /// 该谓词是否需要已解析的目标 IP
    pub fn needs_resolved_ip(&self) -> bool {
        matches!(
            self,
            RuleUnit::GeoIp(_) | RuleUnit::IpCidr { source: false, .. }
        )
    }

    pub fn matches(&self, metadata: &Metadata, geoip: Option<&GeoIpDb>) -> bool {
        match self {
            RuleUnit::Domain(domain) => {
                !metadata.host.is_empty() && metadata.host.to_lowercase() == *domain
            }
            RuleUnit::DomainSuffix(suffix) => {
                if metadata.host.is_empty() {
                    return false;
                }
                let host = metadata.host.to_lowercase();
                host == *suffix || host.ends_with(&format!(".{}", suffix))
            }
            RuleUnit::DomainKeyword(keyword) => {
                !metadata.host.is_empty() && metadata.host.to_lowercase().contains(keyword)
            }
            RuleUnit::GeoIp(country) => {
                let Some(ip) = Self::dest_ip(metadata) else {
                    return false;
                };
                geoip
                    .map(|db| db.lookup_country(ip).as_deref() == Some(country))
                    .unwrap_or(false)
            }
            RuleUnit::IpCidr { net, source } => {
                let ip = if *source {
                    Some(metadata.src_ip)
                } else {
                    Self::dest_ip(metadata)
                };
                ip.map(|ip| net.contains(&ip)).unwrap_or(false)
            }
            RuleUnit::Port { port, source } => {
                if *source {
                    metadata.src_port == *port
                } else {
                    metadata.dst_port == *port
                }
            }
            RuleUnit::Proto(network) => metadata.network == *network,
            RuleUnit::Process(name) => metadata
                .process
                .as_deref()
                .map(|p| p.eq_ignore_ascii_case(name))
                .unwrap_or(false),
            RuleUnit::Match => true,
        }
    }

    /// 目标 IP：已解析的优先，host 为 IP 字面量时也可用
    fn dest_ip(metadata: &Metadata) -> Option<IpAddr> {
        metadata
            .dst_ip
            .or_else(|| metadata.host.parse::<IpAddr>().ok())
    }
}

impl fmt::Display for RuleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleUnit::Domain(v) => write!(f, "Domain({})", v),
            RuleUnit::DomainSuffix(v) => write!(f, "DomainSuffix({})", v),
            RuleUnit::DomainKeyword(v) => write!(f, "DomainKeyword({})", v),
            RuleUnit::GeoIp(v) => write!(f, "GeoIp({})", v),
            RuleUnit::IpCidr { net, source: false } => write!(f, "IpCidr({})", net),
            RuleUnit::IpCidr { net, source: true } => write!(f, "SrcIpCidr({})", net),
            RuleUnit::Port { port, source: false } => write!(f, "DstPort({})", port),
            RuleUnit::Port { port, source: true } => write!(f, "SrcPort({})", port),
            RuleUnit::Proto(n) => write!(f, "Proto({})", n.as_str()),
            RuleUnit::Process(v) => write!(f, "Process({})", v),
            RuleUnit::Match => write!(f, "Match"),
        }
    }
}

/// 路由规则：若干谓词的合取（支持按谓词取反）+ 目标出站名 + 参数。
///
/// 规则一经解析即不可变；匹配需要已解析 IP 且未带 no-resolve 参数时,
/// tunnel 会在测试该规则前触发一次 DNS 解析。
#[derive(Debug, Clone)]
pub struct Rule {
    units: Vec<(RuleUnit, bool)>,
    adapter: String,
    params: Vec<String>,
}

impl Rule {
    /// 解析一条规则串。
    ///
    /// 形式：`TYPE,payload[,TYPE,payload...],TARGET[,param...]`，
    /// payload 前缀 `!` 表示取反；`MATCH,TARGET` 为兜底规则。
    pub fn parse(line: &str) -> Result<Rule> {
        let tokens: Vec<&str> = line.split(',').map(str::trim).collect();
        let fail = |reason: &str| RouteError::RuleParse {
            rule: line.to_string(),
            reason: reason.to_string(),
        };

        if tokens.is_empty() || tokens[0].is_empty() {
            return Err(fail("empty rule").into());
        }

        if tokens[0] == "MATCH" {
            if tokens.len() < 2 {
                return Err(fail("MATCH needs a target").into());
            }
            return Ok(Rule {
                units: vec![(RuleUnit::Match, false)],
                adapter: tokens[1].to_string(),
                params: tokens[2..].iter().map(|s| s.to_string()).collect(),
            });
        }

        let mut units = Vec::new();
        let mut i = 0;
        while i + 1 < tokens.len() {
            let kind = tokens[i];
            let (payload, negate) = match tokens[i + 1].strip_prefix('!') {
                Some(rest) => (rest, true),
                None => (tokens[i + 1], false),
            };
            match RuleUnit::parse(kind, payload) {
                Ok(Some(unit)) => {
                    units.push((unit, negate));
                    i += 2;
                }
                Ok(None) => break,
                Err(reason) => return Err(fail(&reason).into()),
            }
        }

        if units.is_empty() {
            return Err(fail(&format!("unknown or incomplete rule type '{}'", tokens[0])).into());
        }
        if i >= tokens.len() {
            return Err(fail("missing target").into());
        }

        Ok(Rule {
            units,
            adapter: tokens[i].to_string(),
            params: tokens[i + 1..].iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// 匹配该规则前是否需要解析目标 IP
    pub fn should_resolve_ip(&self) -> bool {
        if self.params.iter().any(|p| p == NO_RESOLVE) {
            return false;
        }
        self.units.iter().any(|(unit, _)| unit.needs_resolved_ip())
    }

    /// 所有谓词（按取反修饰后）都成立才算命中
    pub fn matches(&self, metadata: &Metadata, geoip: Option<&GeoIpDb>) -> bool {
        self.units
            .iter()
            .all(|(unit, negate)| unit.matches(metadata, geoip) != *negate)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .units
            .iter()
            .map(|(unit, negate)| {
                if *negate {
                    format!("not {}", unit)
                } else {
                    unit.to_string()
                }
            })
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// 批量解析，任何一条失败都中止
pub fn parse_rules(lines: &[String]) -> Result<Vec<Rule>> {
    lines.iter().map(|line| Rule::parse(line)).collect()
}
