pub mod group;
pub mod outbound;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{Address, ProxyStream};
use group::ProxyGroup;

/// 保留的直连策略名，不经过 resolver 查找
pub const DIRECT: &str = "DIRECT";
/// 保留的拒绝策略名，不经过 resolver 查找
pub const REJECT: &str = "REJECT";

pub fn is_reserved(name: &str) -> bool {
    name == DIRECT || name == REJECT
}

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

/// "tcp4" / "tcp6" / "udp6" 等归一到同一协议族
impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        if lower.starts_with("tcp") {
            Ok(Network::Tcp)
        } else if lower.starts_with("udp") {
            Ok(Network::Udp)
        } else {
            anyhow::bail!("unknown network '{}'", s)
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 出站处理器 trait
///
/// 叶子出站（DIRECT / REJECT / 协议客户端）和所有代理组都实现它。
/// 调用方通过丢弃 future 或包一层 `tokio::time::timeout` 实现取消与超时。
#[async_trait]
pub trait OutboundHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// 类型标签，如 "direct"、"http"、"select"
    fn kind(&self) -> &str;

    async fn dial(&self, network: Network, target: &Address) -> Result<ProxyStream>;

    /// 访问 `url` 测量延迟（毫秒）
    async fn test(&self, url: &str, timeout: Duration) -> Result<u64>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// 代理服务器地址，中继链用它确定下一跳
    fn server_addr(&self) -> Option<Address> {
        None
    }

    /// 是否支持在已有连接上建立隧道
    fn as_tunnel(&self) -> Option<&dyn TunnelConnector> {
        None
    }

    /// 代理组返回自身的组视图
    fn as_group(&self) -> Option<&dyn ProxyGroup> {
        None
    }

    /// 用于 downcasting 到具体类型
    fn as_any(&self) -> &dyn std::any::Any;
}

/// 在已建立的流上完成代理握手，返回通往 `target` 的隧道
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect_over(
        &self,
        stream: ProxyStream,
        network: Network,
        target: &Address,
    ) -> Result<ProxyStream>;
}

/// 名称 -> 出站 的查找函数；`None` 表示未找到
///
/// 由组合根构造并在所有代理组间共享，拨号时才解析，支持前向引用。
pub type ProxyResolver = Arc<dyn Fn(&str) -> Option<Arc<dyn OutboundHandler>> + Send + Sync>;
