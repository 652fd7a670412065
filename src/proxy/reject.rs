use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::{Address, BoxUdpTransport, ProxyStream, UdpPacket, UdpTransport};
use crate::proxy::{HealthState, Metadata, OutboundHandler, OutboundKind};

/// 拒绝出站：TCP 直接报错断开，UDP 静默吞掉
pub struct RejectOutbound {
    name: String,
    health: HealthState,
}

impl RejectOutbound {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health: HealthState::new(),
        }
    }
}

#[async_trait]
impl OutboundHandler for RejectOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Reject
    }

    fn health(&self) -> &HealthState {
        &self.health
    }

    async fn connect(&self, metadata: &Metadata) -> Result<ProxyStream> {
        debug!(target = %metadata.target(), "reject: connection blocked");
        anyhow::bail!("connection rejected by outbound '{}'", self.name)
    }

    async fn connect_udp(&self, metadata: &Metadata) -> Result<(BoxUdpTransport, Address)> {
        debug!(target = %metadata.target(), "reject: UDP session blackholed");
        Ok((Box::new(BlackholeUdpTransport), metadata.target()))
    }

    fn supports_udp(&self) -> bool {
        true
    }
}

struct BlackholeUdpTransport;

#[async_trait]
impl UdpTransport for BlackholeUdpTransport {
    async fn send(&self, _packet: UdpPacket) -> Result<()> {
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        // 永不回包，会话由空闲超时回收
        futures_util::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{InboundKind, Network};

    #[tokio::test]
    async fn reject_tcp_fails() {
        let outbound = RejectOutbound::new("REJECT");
        let metadata = Metadata {
            network: Network::Tcp,
            inbound: InboundKind::Socks,
            src_ip: "127.0.0.1".parse().unwrap(),
            src_port: 1,
            dst_ip: None,
            host: "blocked.example".to_string(),
            dst_port: 443,
            process: None,
        };
        assert!(outbound.connect(&metadata).await.is_err());
    }

    #[tokio::test]
    async fn reject_udp_swallows() {
        let outbound = RejectOutbound::new("REJECT");
        let metadata = Metadata {
            network: Network::Udp,
            inbound: InboundKind::Socks,
            src_ip: "127.0.0.1".parse().unwrap(),
            src_port: 1,
            dst_ip: None,
            host: "blocked.example".to_string(),
            dst_port: 53,
            process: None,
        };
        let (transport, _) = outbound.connect_udp(&metadata).await.unwrap();
        transport
            .send(UdpPacket {
                addr: metadata.target(),
                data: bytes::Bytes::from_static(b"x"),
            })
            .await
            .unwrap();
    }
}
