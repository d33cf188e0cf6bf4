use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::common::{Address, ProxyStream, RouterError};
use crate::proxy::group::health;
use crate::proxy::outbound::direct::{connect_tcp, CONNECT_TIMEOUT};
use crate::proxy::{Network, OutboundHandler, TunnelConnector};

const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 出站代理
///
/// 实现 RFC 1928 SOCKS5 协议的客户端侧：
/// - 方法协商（无认证 / 用户名密码）
/// - CONNECT 命令 (TCP)
pub struct Socks5Outbound {
    name: String,
    server: Address,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Outbound {
    pub fn new(
        name: impl Into<String>,
        server: Address,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        let name = name.into();
        debug!(name = name, server = %server, auth = username.is_some(), "socks5 outbound created");
        Self {
            name,
            server,
            username,
            password,
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    /// 方法协商 + 可选认证
    async fn handshake(&self, stream: &mut (impl AsyncRead + AsyncWrite + Unpin)) -> Result<()> {
        let credentials = self.credentials();

        if credentials.is_some() {
            // NO_AUTH(0x00) 和 USERNAME_PASSWORD(0x02)
            stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
        } else {
            stream.write_all(&[0x05, 0x01, 0x00]).await?;
        }

        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await?;

        if resp[0] != 0x05 {
            anyhow::bail!("socks5: server returned unsupported version: 0x{:02x}", resp[0]);
        }

        match (resp[1], credentials) {
            (0x00, _) => {
                debug!("socks5: no authentication required");
            }
            (0x02, Some((username, password))) => {
                stream.write_all(&auth_request(username, password)?).await?;

                let mut auth_resp = [0u8; 2];
                stream.read_exact(&mut auth_resp).await?;

                if auth_resp[1] != 0x00 {
                    anyhow::bail!("socks5: authentication failed (status: 0x{:02x})", auth_resp[1]);
                }
                debug!("socks5: authentication successful");
            }
            (0xFF, _) => {
                anyhow::bail!("socks5: server rejected all authentication methods");
            }
            (method, _) => {
                anyhow::bail!("socks5: unsupported auth method selected: 0x{:02x}", method);
            }
        }

        Ok(())
    }

    /// 发送请求并读取回复，返回 BND.ADDR
    async fn send_request(
        &self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        cmd: u8,
        target: &Address,
    ) -> Result<Address> {
        let mut req = BytesMut::with_capacity(64);
        req.put_u8(0x05);
        req.put_u8(cmd);
        req.put_u8(0x00);
        target.encode_socks5(&mut req)?;
        stream.write_all(&req).await?;

        let mut resp_head = [0u8; 3];
        stream.read_exact(&mut resp_head).await?;

        if resp_head[0] != 0x05 {
            anyhow::bail!("socks5: invalid reply version: 0x{:02x}", resp_head[0]);
        }
        if resp_head[1] != 0x00 {
            let reason = match resp_head[1] {
                0x01 => "general failure",
                0x02 => "connection not allowed",
                0x03 => "network unreachable",
                0x04 => "host unreachable",
                0x05 => "connection refused",
                0x06 => "TTL expired",
                0x07 => "command not supported",
                0x08 => "address type not supported",
                _ => "unknown error",
            };
            anyhow::bail!("socks5: request failed: {} (0x{:02x})", reason, resp_head[1]);
        }

        let mut atyp = [0u8; 1];
        stream.read_exact(&mut atyp).await?;
        let bind_addr = match atyp[0] {
            0x01 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let port = stream.read_u16().await?;
                Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
            }
            0x03 => {
                let len = stream.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                stream.read_exact(&mut domain).await?;
                let port = stream.read_u16().await?;
                Address::Domain(String::from_utf8_lossy(&domain).to_string(), port)
            }
            0x04 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let port = stream.read_u16().await?;
                Address::Ip(SocketAddr::new(IpAddr::V6(addr.into()), port))
            }
            other => {
                anyhow::bail!("socks5: unsupported bind address type: 0x{:02x}", other);
            }
        };

        Ok(bind_addr)
    }

    async fn connect_stream(&self, mut stream: ProxyStream, target: &Address) -> Result<ProxyStream> {
        self.handshake(&mut stream).await?;
        let _bind = self.send_request(&mut stream, CMD_CONNECT, target).await?;
        debug!(proxy = self.name, target = %target, "socks5 CONNECT tunnel established");
        Ok(stream)
    }
}

#[async_trait]
impl OutboundHandler for Socks5Outbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "socks5"
    }

    async fn dial(&self, network: Network, target: &Address) -> Result<ProxyStream> {
        if network == Network::Udp {
            return Err(RouterError::Unsupported("socks5 UDP over a stream dial".into()).into());
        }
        debug!(target = %target, server = %self.server, "socks5 CONNECT");
        let stream = connect_tcp(&self.server, CONNECT_TIMEOUT).await?;
        self.connect_stream(Box::new(stream), target).await
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
impl TunnelConnector for Socks5Outbound {
    async fn connect_over(
        &self,
        stream: ProxyStream,
        network: Network,
        target: &Address,
    ) -> Result<ProxyStream> {
        if network == Network::Udp {
            return Err(RouterError::Unsupported("socks5 UDP over a stream dial".into()).into());
        }
        self.connect_stream(stream, target).await
    }
}

/// RFC 1929 用户名/密码子协商请求，两个字段都不能超过 255 字节
fn auth_request(username: &str, password: &str) -> Result<Vec<u8>> {
    let too_long = |field: &str, len: usize| {
        RouterError::Config(format!("socks5: {} too long ({} bytes)", field, len))
    };
    let ulen = u8::try_from(username.len()).map_err(|_| too_long("username", username.len()))?;
    let plen = u8::try_from(password.len()).map_err(|_| too_long("password", password.len()))?;

    let mut req = Vec::with_capacity(3 + username.len() + password.len());
    req.push(0x01);
    req.push(ulen);
    req.extend_from_slice(username.as_bytes());
    req.push(plen);
    req.extend_from_slice(password.as_bytes());
    Ok(req)
}
