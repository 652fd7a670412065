use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::proxy::{HealthState, Metadata, OutboundHandler, OutboundKind};

const VER: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 代理出站（TCP CONNECT）
pub struct Socks5Outbound {
    name: String,
    server: Address,
    username: Option<String>,
    password: Option<String>,
    health: HealthState,
}

impl Socks5Outbound {
    pub fn new(
        name: impl Into<String>,
        server: Address,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            server,
            username,
            password,
            health: HealthState::new(),
        }
    }

    async fn handshake(&self, mut stream: ProxyStream, target: &Address) -> Result<ProxyStream> {
        let with_auth = self.username.is_some() && self.password.is_some();
        if with_auth {
            stream
                .write_all(&[VER, 0x02, METHOD_NONE, METHOD_USERPASS])
                .await?;
        } else {
            stream.write_all(&[VER, 0x01, METHOD_NONE]).await?;
        }

        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await?;
        if method[0] != VER {
            anyhow::bail!("SOCKS5 bad version: {:#04x}", method[0]);
        }
        match method[1] {
            METHOD_NONE => {}
            METHOD_USERPASS => {
                let (Some(user), Some(pass)) = (&self.username, &self.password) else {
                    anyhow::bail!("SOCKS5 server requires authentication");
                };
                let mut auth = vec![0x01, user.len() as u8];
                auth.extend_from_slice(user.as_bytes());
                auth.push(pass.len() as u8);
                auth.extend_from_slice(pass.as_bytes());
                stream.write_all(&auth).await?;

                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    anyhow::bail!("SOCKS5 authentication rejected");
                }
            }
            other => anyhow::bail!("SOCKS5 no acceptable method: {:#04x}", other),
        }

        let mut request = BytesMut::with_capacity(272);
        request.extend_from_slice(&[VER, CMD_CONNECT, 0x00]);
        target.encode_socks5(&mut request);
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            anyhow::bail!("SOCKS5 CONNECT failed: reply={}", reply[1]);
        }
        // 消费 BND.ADDR + BND.PORT
        match reply[3] {
            0x01 => {
                let mut bind = [0u8; 6];
                stream.read_exact(&mut bind).await?;
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut bind = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut bind).await?;
            }
            0x04 => {
                let mut bind = [0u8; 18];
                stream.read_exact(&mut bind).await?;
            }
            other => anyhow::bail!("SOCKS5 bad bind address type: {:#04x}", other),
        }
        Ok(stream)
    }
}

#[async_trait]
impl OutboundHandler for Socks5Outbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Socks5
    }

    fn health(&self) -> &HealthState {
        &self.health
    }

    async fn connect(&self, metadata: &Metadata) -> Result<ProxyStream> {
        let server = self.server.resolve().await?;
        debug!(proxy = self.name, server = %server, target = %metadata.target(), "socks5 connect");
        let stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true)?;
        self.handshake(Box::new(stream), &metadata.target()).await
    }

    fn server_addr(&self) -> Option<Address> {
        Some(self.server.clone())
    }

    async fn connect_over(&self, stream: ProxyStream, metadata: &Metadata) -> Result<ProxyStream> {
        self.handshake(stream, &metadata.target()).await
    }
}
