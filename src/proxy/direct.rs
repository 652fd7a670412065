use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::common::{Address, BoxUdpTransport, ProxyStream, UdpPacket, UdpTransport};
use crate::proxy::{HealthState, Metadata, OutboundHandler, OutboundKind};

/// 直连出站
pub struct DirectOutbound {
    name: String,
    health: HealthState,
}

impl DirectOutbound {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health: HealthState::new(),
        }
    }

    async fn resolve_target(&self, metadata: &Metadata) -> Result<SocketAddr> {
        // 路由阶段已解析过的 IP 直接复用
        if let Some(ip) = metadata.dst_ip {
            return Ok(SocketAddr::new(ip, metadata.dst_port));
        }
        metadata.target().resolve().await
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Direct
    }

    fn health(&self) -> &HealthState {
        &self.health
    }

    async fn connect(&self, metadata: &Metadata) -> Result<ProxyStream> {
        let addr = self.resolve_target(metadata).await?;
        debug!(target = %metadata.target(), resolved = %addr, "direct connect");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn connect_udp(&self, metadata: &Metadata) -> Result<(BoxUdpTransport, Address)> {
        let remote = self.resolve_target(metadata).await?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        debug!(local = %socket.local_addr()?, remote = %remote, "direct UDP socket bound");
        Ok((
            Box::new(DirectUdpTransport {
                socket: Arc::new(socket),
            }),
            Address::Ip(remote),
        ))
    }

    fn supports_udp(&self) -> bool {
        true
    }
}

struct DirectUdpTransport {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl UdpTransport for DirectUdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        let addr = packet.addr.resolve().await?;
        self.socket.send_to(&packet.data, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        let mut buf = vec![0u8; 65535];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(UdpPacket {
            addr: Address::Ip(from),
            data: Bytes::from(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{InboundKind, Network};

    fn metadata_to(addr: SocketAddr) -> Metadata {
        Metadata {
            network: Network::Tcp,
            inbound: InboundKind::Socks,
            src_ip: "127.0.0.1".parse().unwrap(),
            src_port: 50000,
            dst_ip: Some(addr.ip()),
            host: String::new(),
            dst_port: addr.port(),
            process: None,
        }
    }

    #[tokio::test]
    async fn direct_tcp_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let outbound = DirectOutbound::new("DIRECT");
        let result = outbound.connect(&metadata_to(addr)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn direct_udp_round_trip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let outbound = DirectOutbound::new("DIRECT");
        let mut meta = metadata_to(echo_addr);
        meta.network = Network::Udp;
        let (transport, remote) = outbound.connect_udp(&meta).await.unwrap();
        assert_eq!(remote, Address::Ip(echo_addr));

        transport
            .send(UdpPacket {
                addr: remote,
                data: Bytes::from_static(b"ping"),
            })
            .await
            .unwrap();
        let reply = transport.recv().await.unwrap();
        assert_eq!(&reply.data[..], b"ping");
    }

    #[test]
    fn direct_supports_udp() {
        assert!(DirectOutbound::new("DIRECT").supports_udp());
    }
}
