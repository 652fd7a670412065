use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{Address, BoxUdpTransport, ProxyStream};
use crate::proxy::{HealthState, Metadata, OutboundHandler, OutboundKind};

use super::health::{HealthCheckHub, DEFAULT_CHECK_TIMEOUT};

const MAX_RETRY: usize = 3;

/// 负载均衡组：按目标粘滞键做跳跃一致性哈希选择成员
pub struct LoadBalanceGroup {
    name: String,
    members: Vec<Arc<dyn OutboundHandler>>,
    hub: Arc<HealthCheckHub>,
    health: HealthState,
    token: CancellationToken,
    /// 同一时刻只允许一轮组检查；不经过单飞组，避免陈旧检查阻塞新拨号
    checking: Arc<AtomicBool>,
}

impl LoadBalanceGroup {
    pub fn new(
        name: String,
        members: Vec<Arc<dyn OutboundHandler>>,
        url: Option<String>,
        interval: Duration,
        hub: Arc<HealthCheckHub>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        if members.is_empty() {
            anyhow::bail!("load-balance group '{}' has no members", name);
        }
        let token = parent.child_token();
        let checking = Arc::new(AtomicBool::new(false));
        if let Some(url) = url {
            spawn_check_loop(
                name.clone(),
                members.clone(),
                url,
                interval,
                hub.clone(),
                checking.clone(),
                token.clone(),
            );
        }
        Ok(Self {
            name,
            members,
            hub,
            health: HealthState::new(),
            token,
            checking,
        })
    }

    fn pick(&self, metadata: &Metadata) -> Arc<dyn OutboundHandler> {
        let buckets = self.members.len() as i32;
        let mut key = hash_key(&sticky_key(metadata));
        for _ in 0..MAX_RETRY {
            let idx = jump_hash(key, buckets) as usize;
            if self.members[idx].alive() {
                return self.members[idx].clone();
            }
            key = key.wrapping_add(1);
        }
        self.members[0].clone()
    }
}

/// 粘滞键：IP 字面量 host 优先，其次 host 的有效顶级域，最后目标 IP 文本。
/// 让同一客户端访问同一站点时尽量落在同一个上游。
fn sticky_key(metadata: &Metadata) -> String {
    if !metadata.host.is_empty() {
        if metadata.host.parse::<IpAddr>().is_ok() {
            return metadata.host.clone();
        }
        return effective_tld_plus_one(&metadata.host);
    }
    metadata
        .dst_ip
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

/// 有效顶级域 + 1 的近似：公共二级后缀（如 co.uk）保留三段，其余两段
fn effective_tld_plus_one(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return host.to_string();
    }
    let last = labels[labels.len() - 1];
    let second = labels[labels.len() - 2];
    let keep = if last.len() == 2
        && matches!(second, "co" | "com" | "net" | "org" | "gov" | "edu" | "ac")
    {
        3.min(labels.len())
    } else {
        2
    };
    labels[labels.len() - keep..].join(".")
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Jump consistent hash (Lamping & Veach, 2014)。
/// 与经典实现逐位一致，保证同一代理序在重启后桶分配不变。
pub fn jump_hash(mut key: u64, buckets: i32) -> i32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1)) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as i32
}

#[allow(clippy::too_many_arguments)]
fn spawn_check_loop(
    name: String,
    members: Vec<Arc<dyn OutboundHandler>>,
    url: String,
    interval: Duration,
    hub: Arc<HealthCheckHub>,
    checking: Arc<AtomicBool>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if token.is_cancelled() {
            return;
        }
        info!(group = name, "health check loop started");
        loop {
            if checking
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let prefix = HealthCheckHub::flight_key(&name, &url, DEFAULT_CHECK_TIMEOUT);
                let result = hub
                    .race_members(
                        members.clone(),
                        prefix,
                        url.clone(),
                        DEFAULT_CHECK_TIMEOUT,
                        true,
                        token.clone(),
                    )
                    .await;
                checking.store(false, Ordering::SeqCst);
                debug!(group = name, delay = ?result.as_ref().ok(), "periodic health check round");
            } else {
                debug!(group = name, "health check already running, skipped");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => break,
            }
        }
    });
}

#[async_trait]
impl OutboundHandler for LoadBalanceGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::LoadBalance
    }

    fn health(&self) -> &HealthState {
        &self.health
    }

    fn alive(&self) -> bool {
        true
    }

    async fn connect(&self, metadata: &Metadata) -> Result<ProxyStream> {
        let member = self.pick(metadata);
        debug!(group = self.name, selected = member.name(), "load-balance connecting");
        member.connect(metadata).await
    }

    async fn connect_udp(&self, metadata: &Metadata) -> Result<(BoxUdpTransport, Address)> {
        self.pick(metadata).connect_udp(metadata).await
    }

    fn supports_udp(&self) -> bool {
        true
    }

    fn unwrap_member(&self, metadata: &Metadata) -> Option<Arc<dyn OutboundHandler>> {
        Some(self.pick(metadata))
    }

    async fn health_check(&self, url: &str, timeout: Duration) -> Result<u16> {
        if self
            .checking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("health check for '{}' already in flight", self.name);
        }
        let prefix = HealthCheckHub::flight_key(&self.name, url, timeout);
        let result = self
            .hub
            .race_members(
                self.members.clone(),
                prefix,
                url.to_string(),
                timeout,
                false,
                self.token.clone(),
            )
            .await;
        self.checking.store(false, Ordering::SeqCst);
        if let Ok(delay) = &result {
            self.health.record_delay(*delay);
        }
        result
    }

    fn destroy(&self) {
        self.token.cancel();
    }

    fn describe(&self) -> serde_json::Value {
        let all: Vec<&str> = self.members.iter().map(|m| m.name()).collect();
        serde_json::json!({
            "name": self.name,
            "type": self.kind().as_str(),
            "all": all,
        })
    }
}
