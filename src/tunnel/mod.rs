use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{BoxUdpTransport, ProxyStream, RouteError, TrafficStats, UdpPacket};
use crate::dns::DnsResolver;
use crate::nat::{NatEntry, NatTable, Pool, PoolEntry, SessionKey};
use crate::proxy::{Metadata, Network, OutboundHandler};
use crate::rule::process::ProcessLookup;
use crate::rule::{GeoIpDb, Rule};

/// UDP 会话空闲回收时间
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub const DIRECT_OUTBOUND: &str = "DIRECT";
pub const GLOBAL_OUTBOUND: &str = "GLOBAL";

/// 出站决策模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Direct,
    Global,
    Rule,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::Global => "global",
            Mode::Rule => "rule",
        }
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Mode::Direct),
            "global" => Ok(Mode::Global),
            "rule" => Ok(Mode::Rule),
            other => anyhow::bail!("unknown mode '{}'", other),
        }
    }
}

/// 不可变配置快照；热重载时整体替换，读者不会看到新旧混合
#[derive(Clone)]
pub struct Snapshot {
    pub rules: Vec<Rule>,
    pub proxies: HashMap<String, Arc<dyn OutboundHandler>>,
    pub mode: Mode,
    pub ignore_resolve_fail: bool,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            proxies: HashMap::new(),
            mode: Mode::Rule,
            ignore_resolve_fail: false,
        }
    }
}

/// 入站适配器推入的 TCP 连接
pub struct TcpSession {
    pub metadata: Metadata,
    pub stream: ProxyStream,
}

/// 入站适配器推入的 UDP 数据报；`reply` 是回写客户端的通道
pub struct UdpDatagram {
    pub metadata: Metadata,
    pub data: Bytes,
    pub reply: Arc<BoxUdpTransport>,
}

/// 顶层分发器。
///
/// 两条无界入站队列各有一个常驻消费者；TCP 每连接一个处理任务，UDP 经
/// NAT 表 + 创建锁保证每个会话键只拨一次上游。
pub struct Tunnel {
    state: RwLock<Arc<Snapshot>>,
    tcp_tx: mpsc::UnboundedSender<TcpSession>,
    udp_tx: mpsc::UnboundedSender<UdpDatagram>,
    traffic: Arc<TrafficStats>,
    nat: Arc<NatTable>,
    pool: Arc<Pool>,
    resolver: Arc<dyn DnsResolver>,
    geoip: Option<Arc<GeoIpDb>>,
    process: Option<Arc<dyn ProcessLookup>>,
    token: CancellationToken,
}

impl Tunnel {
    pub fn new(
        resolver: Arc<dyn DnsResolver>,
        geoip: Option<Arc<GeoIpDb>>,
        process: Option<Arc<dyn ProcessLookup>>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (tcp_tx, mut tcp_rx) = mpsc::unbounded_channel::<TcpSession>();
        let (udp_tx, mut udp_rx) = mpsc::unbounded_channel::<UdpDatagram>();
        let token = parent.child_token();

        let tunnel = Arc::new(Self {
            state: RwLock::new(Arc::new(Snapshot::empty())),
            tcp_tx,
            udp_tx,
            traffic: Arc::new(TrafficStats::new()),
            nat: Arc::new(NatTable::new()),
            pool: Arc::new(Pool::new()),
            resolver,
            geoip,
            process,
            token: token.clone(),
        });

        let consumer = tunnel.clone();
        let tcp_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    session = tcp_rx.recv() => match session {
                        Some(session) => {
                            let tunnel = consumer.clone();
                            tokio::spawn(async move { tunnel.handle_tcp(session).await });
                        }
                        None => break,
                    },
                    _ = tcp_token.cancelled() => break,
                }
            }
        });

        let consumer = tunnel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    datagram = udp_rx.recv() => match datagram {
                        Some(datagram) => consumer.clone().handle_udp(datagram).await,
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
        });

        tunnel
    }

    /// 入站适配器提交 TCP 连接
    pub fn submit_tcp(&self, session: TcpSession) {
        let _ = self.tcp_tx.send(session);
    }

    /// 入站适配器提交 UDP 数据报
    pub fn submit_udp(&self, datagram: UdpDatagram) {
        let _ = self.udp_tx.send(datagram);
    }

    pub fn traffic(&self) -> &Arc<TrafficStats> {
        &self.traffic
    }

    pub fn nat(&self) -> &Arc<NatTable> {
        &self.nat
    }

    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.state.read().await.clone()
    }

    pub async fn mode(&self) -> Mode {
        self.state.read().await.mode
    }

    /// 整体安装新的规则与出站表；mode 与容错开关保持当前值
    pub async fn install(
        &self,
        rules: Vec<Rule>,
        proxies: HashMap<String, Arc<dyn OutboundHandler>>,
    ) {
        let mut state = self.state.write().await;
        let mut next = (**state).clone();
        next.rules = rules;
        next.proxies = proxies;
        *state = Arc::new(next);
        info!("configuration installed");
    }

    pub async fn set_mode(&self, mode: Mode) {
        let mut state = self.state.write().await;
        let mut next = (**state).clone();
        next.mode = mode;
        *state = Arc::new(next);
        info!(mode = mode.as_str(), "mode changed");
    }

    pub async fn set_ignore_resolve_fail(&self, ignore: bool) {
        let mut state = self.state.write().await;
        let mut next = (**state).clone();
        next.ignore_resolve_fail = ignore;
        *state = Arc::new(next);
    }

    /// 停止入站消费者；在途连接自然收尾
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// 元数据预处理：校验 + fake-ip 反查 + 进程名补全
    async fn prepare_metadata(&self, metadata: &mut Metadata) -> Result<()> {
        if !metadata.valid() {
            return Err(RouteError::InvalidMetadata.into());
        }

        if metadata.host.is_empty() {
            if let Some(ip) = metadata.dst_ip {
                if let Some(host) = self.resolver.ip_to_host(ip).await {
                    debug!(ip = %ip, host = host, "reverse-mapped destination");
                    metadata.host = host;
                    if self.resolver.is_fake_ip() {
                        metadata.dst_ip = None;
                    }
                }
            }
        }

        if metadata.process.is_none() {
            if let Some(lookup) = &self.process {
                metadata.process = lookup.process_name(metadata.network, metadata.source());
            }
        }
        Ok(())
    }

    /// 按当前模式选出站
    pub async fn route(
        &self,
        snapshot: &Snapshot,
        metadata: &mut Metadata,
    ) -> Result<(Arc<dyn OutboundHandler>, Option<Rule>)> {
        match snapshot.mode {
            Mode::Direct => Ok((fixed_outbound(snapshot, DIRECT_OUTBOUND)?, None)),
            Mode::Global => Ok((fixed_outbound(snapshot, GLOBAL_OUTBOUND)?, None)),
            Mode::Rule => self.match_rules(snapshot, metadata).await,
        }
    }

    /// 按声明序匹配规则；首个需要目标 IP 的规则出现时惰性解析一次。
    /// 没有规则命中时回退到 DIRECT。
    pub async fn match_rules(
        &self,
        snapshot: &Snapshot,
        metadata: &mut Metadata,
    ) -> Result<(Arc<dyn OutboundHandler>, Option<Rule>)> {
        let mut resolution_tried = false;

        for rule in &snapshot.rules {
            if !resolution_tried
                && rule.should_resolve_ip()
                && metadata.dst_ip.is_none()
                && !metadata.host.is_empty()
            {
                match self.resolver.resolve(&metadata.host).await {
                    Ok(addrs) if !addrs.is_empty() => {
                        debug!(host = metadata.host, ip = %addrs[0], "resolved for rule matching");
                        metadata.dst_ip = Some(addrs[0]);
                    }
                    Ok(_) | Err(_) if snapshot.ignore_resolve_fail => {
                        debug!(host = metadata.host, "resolve failed, continuing unresolved");
                    }
                    Ok(_) => {
                        return Err(RouteError::ResolveFailure {
                            host: metadata.host.clone(),
                            reason: "no addresses".to_string(),
                        }
                        .into());
                    }
                    Err(e) => {
                        return Err(RouteError::ResolveFailure {
                            host: metadata.host.clone(),
                            reason: e.to_string(),
                        }
                        .into());
                    }
                }
                resolution_tried = true;
            }

            if rule.matches(metadata, self.geoip.as_deref()) {
                let Some(adapter) = snapshot.proxies.get(rule.adapter()) else {
                    continue;
                };
                if metadata.network == Network::Udp && !adapter.supports_udp() {
                    debug!(adapter = adapter.name(), "UDP not supported, rule skipped");
                    continue;
                }
                return Ok((adapter.clone(), Some(rule.clone())));
            }
        }

        Ok((fixed_outbound(snapshot, DIRECT_OUTBOUND)?, None))
    }

    async fn handle_tcp(self: Arc<Self>, session: TcpSession) {
        let TcpSession {
            mut metadata,
            stream: local,
        } = session;

        if let Err(e) = self.prepare_metadata(&mut metadata).await {
            warn!(error = %e, "dropping inbound connection");
            return;
        }

        let snapshot = self.snapshot().await;
        let (proxy, rule) = match self.route(&snapshot, &mut metadata).await {
            Ok(routed) => routed,
            Err(e) => {
                warn!(dest = %metadata, error = %e, "routing failed");
                return;
            }
        };

        let remote = match proxy.connect(&metadata).await {
            Ok(stream) => stream,
            Err(e) => {
                // 拨号失败只断本连接，不改上游存活状态
                warn!(proxy = proxy.name(), dest = %metadata, error = %e, "dial failed");
                return;
            }
        };

        match &rule {
            Some(rule) => info!(
                src = %metadata.source(),
                dest = %metadata,
                rule = %rule,
                proxy = proxy.name(),
                "relaying"
            ),
            None => info!(
                src = %metadata.source(),
                dest = %metadata,
                proxy = proxy.name(),
                "relaying without rule match"
            ),
        }

        match relay(local, remote).await {
            Ok((up, down)) => {
                self.traffic.add_upload(up);
                self.traffic.add_download(down);
                debug!(up = up, down = down, dest = %metadata, "connection closed");
            }
            Err(e) => debug!(dest = %metadata, error = %e, "relay ended with error"),
        }
    }

    async fn handle_udp(self: Arc<Self>, datagram: UdpDatagram) {
        let UdpDatagram {
            mut metadata,
            data,
            reply,
        } = datagram;

        if let Err(e) = self.prepare_metadata(&mut metadata).await {
            warn!(error = %e, "dropping inbound datagram");
            return;
        }

        let key = SessionKey {
            source: metadata.source(),
            dest: metadata.target(),
        };

        if let Some(entry) = self.nat.get(&key).await {
            self.forward_packet(&entry, data).await;
            return;
        }

        let tunnel = self.clone();
        tokio::spawn(async move {
            match tunnel.pool.get(&key) {
                PoolEntry::First(guard) => {
                    tunnel
                        .establish_udp_session(&key, metadata, data, reply)
                        .await;
                    // NAT 表已发布（或确定失败），放行等待者
                    guard.release();
                }
                PoolEntry::Wait(waiter) => {
                    waiter.wait().await;
                    match tunnel.nat.get(&key).await {
                        Some(entry) => tunnel.forward_packet(&entry, data).await,
                        None => debug!(session = %key, "session setup failed, datagram dropped"),
                    }
                }
            }
        });
    }

    async fn establish_udp_session(
        &self,
        key: &SessionKey,
        mut metadata: Metadata,
        data: Bytes,
        reply: Arc<BoxUdpTransport>,
    ) {
        let snapshot = self.snapshot().await;
        let (proxy, rule) = match self.route(&snapshot, &mut metadata).await {
            Ok(routed) => routed,
            Err(e) => {
                warn!(dest = %metadata, error = %e, "udp routing failed");
                return;
            }
        };

        let (transport, remote) = match proxy.connect_udp(&metadata).await {
            Ok(dialed) => dialed,
            Err(e) => {
                warn!(proxy = proxy.name(), dest = %metadata, error = %e, "udp dial failed");
                return;
            }
        };

        match &rule {
            Some(rule) => info!(session = %key, rule = %rule, proxy = proxy.name(), "udp session opened"),
            None => info!(session = %key, proxy = proxy.name(), "udp session opened without rule match"),
        }

        let entry = NatEntry {
            transport: Arc::new(transport),
            remote,
        };
        let pump = udp_pump(
            entry.transport.clone(),
            reply,
            self.traffic.clone(),
            self.token.clone(),
        );
        self.nat.clone().add(key.clone(), entry.clone(), pump).await;

        self.forward_packet(&entry, data).await;
    }

    async fn forward_packet(&self, entry: &NatEntry, data: Bytes) {
        let len = data.len() as u64;
        let packet = UdpPacket {
            addr: entry.remote.clone(),
            data,
        };
        match entry.transport.send(packet).await {
            Ok(()) => self.traffic.add_upload(len),
            Err(e) => debug!(error = %e, "udp upstream send failed"),
        }
    }
}

fn fixed_outbound(snapshot: &Snapshot, name: &str) -> Result<Arc<dyn OutboundHandler>> {
    snapshot
        .proxies
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("outbound '{}' not registered", name))
}

/// 双向数据转发，返回 (上行字节, 下行字节)
pub async fn relay<A, B>(mut a: A, mut b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_to_b, b_to_a) = tokio::io::copy_bidirectional(&mut a, &mut b).await?;
    Ok((a_to_b, b_to_a))
}

/// 上游→客户端泵：读到空闲超时或错误为止，退出即会话结束
fn udp_pump(
    transport: Arc<BoxUdpTransport>,
    reply: Arc<BoxUdpTransport>,
    traffic: Arc<TrafficStats>,
    token: CancellationToken,
) -> impl std::future::Future<Output = ()> + Send + 'static {
    async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = tokio::time::timeout(UDP_IDLE_TIMEOUT, transport.recv()) => {
                    match result {
                        Err(_) => {
                            debug!("udp session idle, evicting");
                            break;
                        }
                        Ok(Err(e)) => {
                            debug!(error = %e, "udp upstream recv failed");
                            break;
                        }
                        Ok(Ok(packet)) => {
                            let len = packet.data.len() as u64;
                            if reply.send(packet).await.is_err() {
                                break;
                            }
                            traffic.add_download(len);
                        }
                    }
                }
            }
        }
    }
}
