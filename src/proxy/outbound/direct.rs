use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{Address, ProxyStream, RouterError};
use crate::proxy::group::health;
use crate::proxy::{Network, OutboundHandler};

/// 直连拨号的默认超时
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// 解析并建立 TCP 连接，整个过程受 `timeout` 约束
pub async fn connect_tcp(target: &Address, timeout: Duration) -> Result<TcpStream> {
    let connect = async {
        let addr = target.resolve().await?;
        debug!(target = %target, resolved = %addr, "tcp connect");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok::<_, anyhow::Error>(stream)
    };
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(RouterError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {} timed out", target),
        ))
        .into()),
    }
}

pub struct DirectOutbound {
    name: String,
    connect_timeout: Duration,
}

impl DirectOutbound {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "direct"
    }

    async fn dial(&self, network: Network, target: &Address) -> Result<ProxyStream> {
        if network == Network::Udp {
            return Err(RouterError::Unsupported("direct UDP over a stream dial".into()).into());
        }
        let stream = connect_tcp(target, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }

    async fn test(&self, url: &str, timeout: Duration) -> Result<u64> {
        health::probe_url(self, url, timeout).await
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
