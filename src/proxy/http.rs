use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::proxy::{HealthState, Metadata, OutboundHandler, OutboundKind};

/// HTTP CONNECT 代理出站
pub struct HttpOutbound {
    name: String,
    server: Address,
    username: Option<String>,
    password: Option<String>,
    health: HealthState,
}

impl HttpOutbound {
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
        let target_str = format!("{}:{}", target.host(), target.port());
        let mut request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
            target_str, target_str
        );
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            let cred = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", user, pass));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", cred));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut header = Vec::with_capacity(512);
        let mut byte = [0u8; 1];
        while header.len() < 16 * 1024 {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                anyhow::bail!("http CONNECT failed: unexpected EOF");
            }
            header.push(byte[0]);
            if header.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        if !header.ends_with(b"\r\n\r\n") {
            anyhow::bail!("http CONNECT failed: response header too large");
        }

        let header_text = String::from_utf8_lossy(&header);
        let status_line = header_text.lines().next().unwrap_or_default();
        let status_code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| {
                anyhow::anyhow!("http CONNECT failed: invalid response '{}'", status_line)
            })?;
        if status_code != 200 {
            anyhow::bail!("http CONNECT failed: {}", status_line);
        }
        Ok(stream)
    }
}

#[async_trait]
impl OutboundHandler for HttpOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Http
    }

    fn health(&self) -> &HealthState {
        &self.health
    }

    async fn connect(&self, metadata: &Metadata) -> Result<ProxyStream> {
        let server = self.server.resolve().await?;
        debug!(proxy = self.name, server = %server, target = %metadata.target(), "http CONNECT");
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
