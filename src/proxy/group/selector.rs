use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::common::{Address, BoxUdpTransport, ProxyStream};
use crate::proxy::{HealthState, Metadata, OutboundHandler, OutboundKind};

/// 手动选择组
pub struct SelectorGroup {
    name: String,
    members: Vec<Arc<dyn OutboundHandler>>,
    selected: AtomicUsize,
    health: HealthState,
}

impl SelectorGroup {
    pub fn new(name: String, members: Vec<Arc<dyn OutboundHandler>>) -> Result<Self> {
        if members.is_empty() {
            anyhow::bail!("selector group '{}' has no members", name);
        }
        Ok(Self {
            name,
            members,
            selected: AtomicUsize::new(0),
            health: HealthState::new(),
        })
    }

    /// 按名字切换成员；不认识的名字返回 false
    pub fn select(&self, name: &str) -> bool {
        match self.members.iter().position(|m| m.name() == name) {
            Some(idx) => {
                self.selected.store(idx, Ordering::Relaxed);
                info!(group = self.name, selected = name, "selection changed");
                true
            }
            None => false,
        }
    }

    pub fn now(&self) -> String {
        self.current().name().to_string()
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name().to_string()).collect()
    }

    fn current(&self) -> Arc<dyn OutboundHandler> {
        let idx = self.selected.load(Ordering::Relaxed).min(self.members.len() - 1);
        self.members[idx].clone()
    }
}

#[async_trait]
impl OutboundHandler for SelectorGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Selector
    }

    fn health(&self) -> &HealthState {
        &self.health
    }

    fn alive(&self) -> bool {
        true
    }

    async fn connect(&self, metadata: &Metadata) -> Result<ProxyStream> {
        self.current().connect(metadata).await
    }

    async fn connect_udp(&self, metadata: &Metadata) -> Result<(BoxUdpTransport, Address)> {
        self.current().connect_udp(metadata).await
    }

    fn supports_udp(&self) -> bool {
        self.current().supports_udp()
    }

    fn unwrap_member(&self, _metadata: &Metadata) -> Option<Arc<dyn OutboundHandler>> {
        Some(self.current())
    }

    fn as_selector(&self) -> Option<&SelectorGroup> {
        Some(self)
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "type": self.kind().as_str(),
            "now": self.now(),
            "all": self.member_names(),
        })
    }
}
