use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{Address, BoxUdpTransport, ProxyStream};
use crate::proxy::{HealthState, Metadata, OutboundHandler, OutboundKind};

use super::health::{HealthCheckHub, DEFAULT_CHECK_TIMEOUT};

/// 故障转移组：始终走列表中第一个存活的成员，全挂时退回成员 0
pub struct FallbackGroup {
    name: String,
    members: Vec<Arc<dyn OutboundHandler>>,
    url: String,
    hub: Arc<HealthCheckHub>,
    health: HealthState,
    token: CancellationToken,
}

impl FallbackGroup {
    pub fn new(
        name: String,
        members: Vec<Arc<dyn OutboundHandler>>,
        url: String,
        interval: Duration,
        hub: Arc<HealthCheckHub>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        if members.is_empty() {
            anyhow::bail!("fallback group '{}' has no members", name);
        }
        let token = parent.child_token();
        spawn_check_loop(
            name.clone(),
            members.clone(),
            url.clone(),
            interval,
            hub.clone(),
            token.clone(),
        );
        Ok(Self {
            name,
            members,
            url,
            hub,
            health: HealthState::new(),
            token,
        })
    }

    pub fn find_alive(&self) -> Arc<dyn OutboundHandler> {
        self.members
            .iter()
            .find(|m| m.alive())
            .cloned()
            .unwrap_or_else(|| self.members[0].clone())
    }

    /// 当前生效的成员名
    pub fn now(&self) -> String {
        self.find_alive().name().to_string()
    }

    pub fn check_url(&self) -> &str {
        &self.url
    }
}

fn spawn_check_loop(
    name: String,
    members: Vec<Arc<dyn OutboundHandler>>,
    url: String,
    interval: Duration,
    hub: Arc<HealthCheckHub>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        // 首次检查稍微延迟，避开启动高峰
        tokio::time::sleep(Duration::from_secs(1)).await;
        if token.is_cancelled() {
            return;
        }
        info!(group = name, "health check loop started");
        loop {
            let result = hub
                .check_group(&name, &members, &url, DEFAULT_CHECK_TIMEOUT, true, &token)
                .await;
            debug!(group = name, delay = ?result.as_ref().ok(), "periodic health check round");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => break,
            }
        }
        debug!(group = name, "health check loop stopped");
    });
}

#[async_trait]
impl OutboundHandler for FallbackGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Fallback
    }

    fn health(&self) -> &HealthState {
        &self.health
    }

    fn alive(&self) -> bool {
        true
    }

    async fn connect(&self, metadata: &Metadata) -> Result<ProxyStream> {
        let member = self.find_alive();
        debug!(group = self.name, selected = member.name(), "fallback connecting");
        member.connect(metadata).await
    }

    async fn connect_udp(&self, metadata: &Metadata) -> Result<(BoxUdpTransport, Address)> {
        self.find_alive().connect_udp(metadata).await
    }

    fn supports_udp(&self) -> bool {
        self.find_alive().supports_udp()
    }

    fn unwrap_member(&self, _metadata: &Metadata) -> Option<Arc<dyn OutboundHandler>> {
        Some(self.find_alive())
    }

    async fn health_check(&self, url: &str, timeout: Duration) -> Result<u16> {
        let result = self
            .hub
            .check_group(&self.name, &self.members, url, timeout, false, &self.token)
            .await;
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
            "now": self.now(),
            "all": all,
        })
    }
}
