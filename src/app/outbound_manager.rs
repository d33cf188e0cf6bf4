use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::common::{Address, RouterError};
use crate::config::types::ProxyConfig;
use crate::proxy::outbound::{DirectOutbound, HttpOutbound, RejectOutbound, Socks5Outbound};
use crate::proxy::OutboundHandler;

/// 按代理记录构造叶子出站
///
/// 配置加载与订阅共用；协议客户端在 crate 之外时通过自定义工厂注入。
pub trait OutboundFactory: Send + Sync {
    fn build(&self, config: &ProxyConfig) -> Result<Arc<dyn OutboundHandler>>;
}

/// 内置工厂：direct / reject / http / socks5
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinOutboundFactory;

impl OutboundFactory for BuiltinOutboundFactory {
    fn build(&self, config: &ProxyConfig) -> Result<Arc<dyn OutboundHandler>> {
        let handler: Arc<dyn OutboundHandler> = match config.proxy_type.to_ascii_lowercase().as_str() {
            "direct" => Arc::new(DirectOutbound::new(config.name.clone())),
            "reject" => Arc::new(RejectOutbound::new(config.name.clone())),
            "http" => {
                if config.params.get("tls").is_some_and(|v| v == "true") {
                    return Err(RouterError::Unsupported(format!(
                        "proxy '{}': HTTPS proxies are not built in",
                        config.name
                    ))
                    .into());
                }
                Arc::new(HttpOutbound::new(
                    config.name.clone(),
                    server_address(config)?,
                    config.username.clone(),
                    config.password.clone(),
                ))
            }
            "socks5" | "socks" => Arc::new(Socks5Outbound::new(
                config.name.clone(),
                server_address(config)?,
                config.username.clone(),
                config.password.clone(),
            )),
            other => {
                return Err(RouterError::Unsupported(format!(
                    "proxy '{}': protocol '{}' has no built-in client",
                    config.name, other
                ))
                .into())
            }
        };
        Ok(handler)
    }
}

fn server_address(config: &ProxyConfig) -> Result<Address> {
    if config.server.is_empty() || config.port == 0 {
        return Err(RouterError::Config(format!(
            "proxy '{}': server and port are required",
            config.name
        ))
        .into());
    }
    Ok(Address::new(&config.server, config.port))
}

/// 配置中的叶子代理表，保持配置顺序
pub struct OutboundManager {
    handlers: HashMap<String, Arc<dyn OutboundHandler>>,
    order: Vec<String>,
}

impl OutboundManager {
    pub fn new(configs: &[ProxyConfig], factory: &dyn OutboundFactory) -> Result<Self> {
        let mut handlers: HashMap<String, Arc<dyn OutboundHandler>> = HashMap::new();
        let mut order = Vec::with_capacity(configs.len());

        for config in configs {
            let handler = factory.build(config)?;
            info!(name = config.name, kind = handler.kind(), "proxy registered");
            handlers.insert(config.name.clone(), handler);
            order.push(config.name.clone());
        }

        Ok(Self { handlers, order })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers.get(name).cloned()
    }

    /// 配置顺序的代理名
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn list(&self) -> &HashMap<String, Arc<dyn OutboundHandler>> {
        &self.handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RouterErrorKind;

    fn proxy(name: &str, kind: &str, server: &str, port: u16) -> ProxyConfig {
        ProxyConfig {
            name: name.into(),
            proxy_type: kind.into(),
            server: server.into(),
            port,
            username: None,
            password: None,
            params: HashMap::new(),
        }
    }

    #[test]
    fn builds_known_types_in_order() {
        let mgr = OutboundManager::new(
            &[
                proxy("s5", "socks5", "127.0.0.1", 1080),
                proxy("web", "HTTP", "127.0.0.1", 8080),
                proxy("lan", "direct", "", 0),
            ],
            &BuiltinOutboundFactory,
        )
        .unwrap();
        assert_eq!(mgr.names(), ["s5", "web", "lan"]);
        assert_eq!(mgr.get("web").unwrap().kind(), "http");
        assert!(mgr.get("web").unwrap().server_addr().is_some());
        assert_eq!(mgr.list().len(), 3);
    }

    #[test]
    fn unknown_protocol_and_missing_server() {
        let err = BuiltinOutboundFactory
            .build(&proxy("v", "vmess", "1.2.3.4", 443))
            .err()
            .unwrap();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::Unsupported);

        let err = BuiltinOutboundFactory
            .build(&proxy("h", "http", "", 0))
            .err()
            .unwrap();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::Config);
    }
}
