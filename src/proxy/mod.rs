pub mod direct;
pub mod group;
pub mod http;
pub mod reject;
pub mod socks5;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, BoxUdpTransport, ProxyStream, RouteError};

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

/// 入站来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Http,
    HttpConnect,
    Socks,
    Redir,
    TProxy,
}

impl InboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundKind::Http => "http",
            InboundKind::HttpConnect => "http-connect",
            InboundKind::Socks => "socks",
            InboundKind::Redir => "redir",
            InboundKind::TProxy => "tproxy",
        }
    }
}

/// 连接元数据。
///
/// host 与 dst_ip 至少有一个已知才算有效；路由期间 tunnel 可能就地补全
/// dst_ip（DNS）或 host（fake-ip 反查），规则命中后不再修改。
#[derive(Debug, Clone)]
pub struct Metadata {
    pub network: Network,
    pub inbound: InboundKind,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: Option<IpAddr>,
    pub host: String,
    pub dst_port: u16,
    pub process: Option<String>,
}

impl Metadata {
    pub fn valid(&self) -> bool {
        !self.host.is_empty() || self.dst_ip.is_some()
    }

    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    /// 拨号目标：域名优先，其次已解析 IP
    pub fn target(&self) -> Address {
        if !self.host.is_empty() {
            Address::Domain(self.host.clone(), self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            Address::Ip(SocketAddr::new(ip, self.dst_port))
        } else {
            Address::Domain(String::new(), self.dst_port)
        }
    }

    /// 健康检查探测用元数据
    pub fn probe(host: String, port: u16) -> Self {
        Self {
            network: Network::Tcp,
            inbound: InboundKind::HttpConnect,
            src_ip: IpAddr::from([0u8, 0, 0, 0]),
            src_port: 0,
            dst_ip: None,
            host,
            dst_port: port,
            process: None,
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.host.is_empty() {
            write!(f, "{}:{}", self.host, self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            write!(f, "{}:{}", ip, self.dst_port)
        } else {
            write!(f, "<unset>:{}", self.dst_port)
        }
    }
}

/// 出站类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    Direct,
    Reject,
    Http,
    Socks5,
    Selector,
    Fallback,
    LoadBalance,
    Relay,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::Direct => "Direct",
            OutboundKind::Reject => "Reject",
            OutboundKind::Http => "Http",
            OutboundKind::Socks5 => "Socks5",
            OutboundKind::Selector => "Selector",
            OutboundKind::Fallback => "Fallback",
            OutboundKind::LoadBalance => "LoadBalance",
            OutboundKind::Relay => "Relay",
        }
    }
}

/// 出站的存活状态与最近一次探测延迟
pub struct HealthState {
    alive: AtomicBool,
    last_delay: AtomicU16,
}

impl HealthState {
    pub fn new() -> Self {
        // 未检查前视为存活，首轮探测失败才摘除
        Self {
            alive: AtomicBool::new(true),
            last_delay: AtomicU16::new(0),
        }
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn last_delay(&self) -> u16 {
        self.last_delay.load(Ordering::Relaxed)
    }

    pub fn record_delay(&self, delay: u16) {
        self.last_delay.store(delay, Ordering::Relaxed);
        self.alive.store(true, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.last_delay.store(0, Ordering::Relaxed);
        self.alive.store(false, Ordering::Relaxed);
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for dyn OutboundHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundHandler")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// 出站能力 trait。
///
/// 具体传输和组适配器都实现它；组的成员列表即 `Arc<dyn OutboundHandler>`，
/// 因此组可以任意嵌套。
#[async_trait]
pub trait OutboundHandler: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn kind(&self) -> OutboundKind;
    fn health(&self) -> &HealthState;

    async fn connect(&self, metadata: &Metadata) -> Result<ProxyStream>;

    /// UDP 拨号，返回报文传输与上游回程地址
    async fn connect_udp(&self, _metadata: &Metadata) -> Result<(BoxUdpTransport, Address)> {
        anyhow::bail!("UDP not supported by outbound '{}'", self.name())
    }

    fn supports_udp(&self) -> bool {
        false
    }

    fn alive(&self) -> bool {
        self.health().alive()
    }

    /// 中继链路用：本出站的服务端地址
    fn server_addr(&self) -> Option<Address> {
        None
    }

    /// 中继链路用：在已建立的流上完成本出站的协议握手
    async fn connect_over(&self, _stream: ProxyStream, _metadata: &Metadata) -> Result<ProxyStream> {
        anyhow::bail!("outbound '{}' cannot chain over an existing stream", self.name())
    }

    /// 组适配器解包：返回当前请求实际使用的具体成员
    fn unwrap_member(&self, _metadata: &Metadata) -> Option<Arc<dyn OutboundHandler>> {
        None
    }

    fn as_selector(&self) -> Option<&group::selector::SelectorGroup> {
        None
    }

    /// 对 url 做一次可用性探测，返回毫秒延迟并更新自身状态
    async fn health_check(&self, url: &str, timeout: Duration) -> Result<u16> {
        let (host, port, path) = group::health::parse_url(url);
        let probe = Metadata::probe(host.clone(), port);
        let start = Instant::now();

        let result: Result<u16> = async {
            let mut stream = tokio::time::timeout(timeout, self.connect(&probe))
                .await
                .map_err(|_| RouteError::HealthCheckTimeout)??;

            let request = format!(
                "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                path, host
            );
            tokio::time::timeout(timeout, stream.write_all(request.as_bytes()))
                .await
                .map_err(|_| RouteError::HealthCheckTimeout)??;

            let mut buf = [0u8; 512];
            let n = tokio::time::timeout(timeout, stream.read(&mut buf))
                .await
                .map_err(|_| RouteError::HealthCheckTimeout)??;
            if n == 0 {
                return Err(RouteError::HealthCheckFailed("empty response".to_string()).into());
            }
            Ok(start.elapsed().as_millis().min(u16::MAX as u128) as u16)
        }
        .await;

        match &result {
            Ok(delay) => self.health().record_delay(*delay),
            Err(_) => self.health().record_failure(),
        }
        result
    }

    /// 停止后台循环；必须幂等
    fn destroy(&self) {}

    /// JSON 可序列化的状态（名称/类型/成员等）
    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "type": self.kind().as_str(),
            "alive": self.alive(),
            "delay": self.health().last_delay(),
        })
    }
}
