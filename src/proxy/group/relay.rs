use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::common::{Address, ProxyStream, RouterError};
use crate::proxy::group::health;
use crate::proxy::outbound::direct::connect_tcp;
use crate::proxy::{Network, OutboundHandler};

use super::{GroupBase, LocalProxies, Membership, ProxyGroup};

/// 连接链首跳服务器的超时
const FIRST_HOP_TIMEOUT: Duration = Duration::from_secs(10);

/// 链式代理组：流量依次穿过每个成员，最后到达目标
pub struct RelayGroup {
    base: GroupBase,
    state: RwLock<Membership>,
}

impl RelayGroup {
    pub fn new(base: GroupBase, chain: Vec<String>) -> Self {
        Self {
            base,
            state: RwLock::new(Membership::new(chain, String::new())),
        }
    }

    async fn dial_chain(
        &self,
        hops: Vec<Arc<dyn OutboundHandler>>,
        network: Network,
        target: &Address,
    ) -> Result<ProxyStream> {
        if network == Network::Udp {
            return Err(RouterError::Unsupported("UDP through a relay chain".into()).into());
        }

        // 先校验整条链，避免建立半截连接
        let mut servers = Vec::with_capacity(hops.len());
        for hop in &hops {
            let server = hop.server_addr().ok_or_else(|| {
                RouterError::Unsupported(format!(
                    "relay '{}': proxy '{}' does not expose a server address",
                    self.name(),
                    hop.name()
                ))
            })?;
            if hop.as_tunnel().is_none() {
                return Err(RouterError::Unsupported(format!(
                    "relay '{}': proxy '{}' does not support tunneling",
                    self.name(),
                    hop.name()
                ))
                .into());
            }
            servers.push(server);
        }

        let first = connect_tcp(&servers[0], FIRST_HOP_TIMEOUT)
            .await
            .with_context(|| format!("relay '{}': connect to first proxy '{}'", self.name(), hops[0].name()))?;
        let mut stream: ProxyStream = Box::new(first);

        // 出错时 stream 随之释放，已建立的部分链路一并关闭
        for i in 1..hops.len() {
            let tunnel = hops[i - 1]
                .as_tunnel()
                .ok_or_else(|| RouterError::Unsupported(format!("proxy '{}' does not support tunneling", hops[i - 1].name())))?;
            stream = tunnel
                .connect_over(stream, Network::Tcp, &servers[i])
                .await
                .with_context(|| {
                    format!(
                        "relay '{}': tunnel from '{}' to '{}'",
                        self.name(),
                        hops[i - 1].name(),
                        hops[i].name()
                    )
                })?;
        }

        let last = &hops[hops.len() - 1];
        let tunnel = last
            .as_tunnel()
            .ok_or_else(|| RouterError::Unsupported(format!("proxy '{}' does not support tunneling", last.name())))?;
        let stream = tunnel.connect_over(stream, network, target).await?;
        debug!(group = self.name(), hops = hops.len(), target = %target, "relay chain established");
        Ok(stream)
    }
}

#[async_trait]
impl OutboundHandler for RelayGroup {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> &str {
        self.base.kind()
    }

    async fn dial(&self, network: Network, target: &Address) -> Result<ProxyStream> {
        let entries = self.state.read().await.entries();
        match entries.len() {
            0 => Err(RouterError::NoSelection(self.name().to_string()).into()),
            1 => {
                let (name, local) = entries.into_iter().next().ok_or_else(|| RouterError::NoSelection(self.name().to_string()))?;
                self.base.safe_dial(&name, local, network, target).await
            }
            _ => {
                let hops = entries
                    .into_iter()
                    .map(|(name, local)| self.base.resolve(&name, local))
                    .collect::<Result<Vec<_>>>()?;
                self.dial_chain(hops, network, target).await
            }
        }
    }

    async fn test(&self, url: &str, timeout: Duration) -> Result<u64> {
        health::probe_url(self, url, timeout).await
    }

    fn as_group(&self) -> Option<&dyn ProxyGroup> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl ProxyGroup for RelayGroup {
    async fn members(&self) -> Vec<String> {
        self.state.read().await.members.clone()
    }

    /// 整条链，如 "a -> b -> c"
    async fn now(&self) -> String {
        self.state.read().await.members.join(" -> ")
    }

    async fn update_proxies(&self, names: Vec<String>, local: LocalProxies) {
        let names = self.base.filter_members(names);
        let mut state = self.state.write().await;
        state.replace(names, local);
        info!(group = self.name(), hops = state.members.len(), "relay chain updated");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::super::testing::*;
    use super::*;
    use crate::common::RouterErrorKind;
    use crate::proxy::outbound::{HttpOutbound, Socks5Outbound};
    use crate::proxy::ProxyResolver;

    /// HTTP CONNECT 代理：只接受一个 CONNECT，随后转发到请求的目标
    async fn spawn_connect_proxy() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut client, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut byte = [0u8; 1];
                    while !buf.ends_with(b"\r\n\r\n") {
                        client.read_exact(&mut byte).await.unwrap();
                        buf.push(byte[0]);
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let target = head.split_whitespace().nth(1).unwrap().to_string();
                    let mut upstream = tokio::net::TcpStream::connect(target).await.unwrap();
                    client
                        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await
                        .unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                });
            }
        });
        addr
    }

    async fn spawn_echo() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });
        addr
    }

    fn resolver(handlers: Vec<Arc<dyn OutboundHandler>>) -> ProxyResolver {
        let table: HashMap<String, Arc<dyn OutboundHandler>> = handlers
            .into_iter()
            .map(|h| (h.name().to_string(), h))
            .collect();
        Arc::new(move |name: &str| table.get(name).cloned())
    }

    #[tokio::test]
    async fn two_hop_chain_reaches_target() {
        let p1 = spawn_connect_proxy().await;
        let p2 = spawn_connect_proxy().await;
        let echo = spawn_echo().await;

        let hop1: Arc<dyn OutboundHandler> =
            Arc::new(HttpOutbound::new("hop1", Address::Ip(p1), None, None));
        let hop2: Arc<dyn OutboundHandler> =
            Arc::new(HttpOutbound::new("hop2", Address::Ip(p2), None, None));
        let base = GroupBase::new("Chain", "relay", resolver(vec![hop1, hop2]), None);
        let g = RelayGroup::new(base, names(&["hop1", "hop2"]));
        assert_eq!(g.now().await, "hop1 -> hop2");

        let mut stream = g.dial(Network::Tcp, &Address::Ip(echo)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn single_member_delegates() {
        let a = MockOutbound::new("a", Ok(10));
        let base = GroupBase::new("Chain", "relay", resolver_of(&[a.clone()]), None);
        let g = RelayGroup::new(base, names(&["a"]));
        g.dial(Network::Tcp, &Address::new("x.test", 80)).await.unwrap();
        assert_eq!(a.dial_count(), 1);
    }

    #[tokio::test]
    async fn hop_without_tunnel_aborts_before_connecting() {
        let a = MockOutbound::new("a", Ok(10));
        let s5: Arc<dyn OutboundHandler> = Arc::new(Socks5Outbound::new(
            "s5",
            Address::new("127.0.0.1", 1),
            None,
            None,
        ));
        let base = GroupBase::new(
            "Chain",
            "relay",
            resolver(vec![a.clone() as Arc<dyn OutboundHandler>, s5]),
            None,
        );
        let g = RelayGroup::new(base, names(&["s5", "a"]));
        let err = g
            .dial(Network::Tcp, &Address::new("x.test", 80))
            .await
            .err()
            .unwrap();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::Unsupported);
        assert_eq!(a.dial_count(), 0);
    }

    #[tokio::test]
    async fn missing_hop_is_not_found_and_empty_chain_errors() {
        let base = GroupBase::new("Chain", "relay", resolver_of(&[]), None);
        let g = RelayGroup::new(base, names(&["x", "y"]));
        let err = g
            .dial(Network::Tcp, &Address::new("x.test", 80))
            .await
            .err()
            .unwrap();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::NotFound);

        g.update_proxies(Vec::new(), LocalProxies::new()).await;
        let err = g
            .dial(Network::Tcp, &Address::new("x.test", 80))
            .await
            .err()
            .unwrap();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::NoSelection);
    }
}
