use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::common::{Address, ProxyStream, RouterError};
use crate::proxy::group::health;
use crate::proxy::outbound::direct::{connect_tcp, CONNECT_TIMEOUT};
use crate::proxy::{Network, OutboundHandler, TunnelConnector};

/// HTTP CONNECT 出站代理
pub struct HttpOutbound {
    name: String,
    server: Address,
    username: Option<String>,
    password: Option<String>,
}

impl HttpOutbound {
    pub fn new(
        name: impl Into<String>,
        server: Address,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        let name = name.into();
        debug!(name = name, server = %server, auth = username.is_some(), "http outbound created");
        Self {
            name,
            server,
            username,
            password,
        }
    }

    fn connect_request(&self, target: &Address) -> String {
        let target_str = target.to_string();
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target_str, target_str);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            let cred = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", cred));
        }
        request.push_str("\r\n");
        request
    }

    /// 在 `stream` 上发送 CONNECT 并等待 200
    async fn handshake(&self, mut stream: ProxyStream, target: &Address) -> Result<ProxyStream> {
        stream.write_all(self.connect_request(target).as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;

        let status_code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| anyhow::anyhow!("http proxy: invalid response: {}", status_line.trim()))?;

        if status_code != 200 {
            anyhow::bail!("http proxy CONNECT failed: {}", status_line.trim());
        }

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                anyhow::bail!("http proxy: connection closed during CONNECT response");
            }
            if line.trim().is_empty() {
                break;
            }
        }

        debug!(proxy = self.name, target = %target, "http CONNECT tunnel established");
        // BufReader 可能已缓冲隧道数据，整体返回
        Ok(Box::new(reader))
    }
}

#[async_trait]
impl OutboundHandler for HttpOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "http"
    }

    async fn dial(&self, network: Network, target: &Address) -> Result<ProxyStream> {
        if network == Network::Udp {
            return Err(RouterError::Unsupported("HTTP outbound does not support UDP".into()).into());
        }
        debug!(target = %target, server = %self.server, "http CONNECT proxy");
        let stream = connect_tcp(&self.server, CONNECT_TIMEOUT).await?;
        self.handshake(Box::new(stream), target).await
    }

    async fn test(&self, url: &str, timeout: Duration) -> Result<u64> {
        health::probe_url(self, url, timeout).await
    }

    fn server_addr(&self) -> Option<Address> {
        Some(self.server.clone())
    }

    fn as_tunnel(&self) -> Option<&dyn TunnelConnector> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl TunnelConnector for HttpOutbound {
    async fn connect_over(
        &self,
        stream: ProxyStream,
        network: Network,
        target: &Address,
    ) -> Result<ProxyStream> {
        if network == Network::Udp {
            return Err(RouterError::Unsupported("HTTP outbound does not support UDP".into()).into());
        }
        self.handshake(stream, target).await
    }
}
