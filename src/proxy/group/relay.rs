use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::proxy::{HealthState, Metadata, OutboundHandler, OutboundKind};

/// 中继组：把成员串成一条链，流量依次穿过每个成员到达目标。
///
/// 成员 0 拨向成员 1 的服务端，之后每个成员在前一跳建立的流上完成
/// 自己的握手；最后一跳的握手目标才是真实目的地址。成员是组时先解包
/// 成本次请求实际生效的具体成员。
pub struct RelayGroup {
    name: String,
    members: Vec<Arc<dyn OutboundHandler>>,
    health: HealthState,
}

impl RelayGroup {
    pub fn new(name: String, members: Vec<Arc<dyn OutboundHandler>>) -> Result<Self> {
        if members.is_empty() {
            anyhow::bail!("relay group '{}' has no members", name);
        }
        Ok(Self {
            name,
            members,
            health: HealthState::new(),
        })
    }

    fn resolve_chain(&self, metadata: &Metadata) -> Vec<Arc<dyn OutboundHandler>> {
        self.members
            .iter()
            .map(|member| {
                let mut current = member.clone();
                while let Some(inner) = current.unwrap_member(metadata) {
                    current = inner;
                }
                current
            })
            .collect()
    }

    fn hop_metadata(base: &Metadata, target: Address) -> Metadata {
        let mut hop = base.clone();
        match target {
            Address::Domain(domain, port) => {
                hop.host = domain;
                hop.dst_ip = None;
                hop.dst_port = port;
            }
            Address::Ip(addr) => {
                hop.host = String::new();
                hop.dst_ip = Some(addr.ip());
                hop.dst_port = addr.port();
            }
        }
        hop
    }
}

#[async_trait]
impl OutboundHandler for RelayGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Relay
    }

    fn health(&self) -> &HealthState {
        &self.health
    }

    fn alive(&self) -> bool {
        true
    }

    async fn connect(&self, metadata: &Metadata) -> Result<ProxyStream> {
        let chain = self.resolve_chain(metadata);
        if chain.len() == 1 {
            return chain[0].connect(metadata).await;
        }

        let last = chain.len() - 1;
        let first_target = chain[1].server_addr().ok_or_else(|| {
            anyhow::anyhow!(
                "relay '{}': member '{}' has no server endpoint",
                self.name,
                chain[1].name()
            )
        })?;
        debug!(relay = self.name, hop = 0, via = chain[0].name(), target = %first_target, "relay dialing");
        let mut stream = chain[0]
            .connect(&Self::hop_metadata(metadata, first_target))
            .await?;

        for idx in 1..=last {
            let target = if idx == last {
                metadata.target()
            } else {
                chain[idx + 1].server_addr().ok_or_else(|| {
                    anyhow::anyhow!(
                        "relay '{}': member '{}' has no server endpoint",
                        self.name,
                        chain[idx + 1].name()
                    )
                })?
            };
            debug!(relay = self.name, hop = idx, via = chain[idx].name(), target = %target, "relay handshaking");
            stream = chain[idx]
                .connect_over(stream, &Self::hop_metadata(metadata, target))
                .await?;
        }
        Ok(stream)
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
