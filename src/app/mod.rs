pub mod outbound_manager;
pub mod subscription;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::common::{ProxyStream, RouterError};
use crate::config::Config;
use crate::proxy::group::{build_group, validate_cycles};
use crate::proxy::outbound::{DirectOutbound, RejectOutbound};
use crate::proxy::{Network, OutboundHandler, ProxyResolver, DIRECT, REJECT};
use crate::router::geoip::{GeoIpDb, GeoIpLookup};
use crate::router::metadata::RequestMetadata;
use crate::router::rules::Rule;
use crate::router::RuleEngine;

use outbound_manager::{BuiltinOutboundFactory, OutboundFactory, OutboundManager};
use subscription::Subscription;

type HandlerTable = HashMap<String, Arc<dyn OutboundHandler>>;

/// 一次路由决策
pub struct Route {
    pub policy: String,
    /// 命中的规则；`None` 表示使用了默认策略
    pub rule: Option<Arc<Rule>>,
    pub handler: Arc<dyn OutboundHandler>,
}

/// 组合根：持有全部代理、代理组与规则表
///
/// 构建分两步：先建叶子代理和组外壳，再把共享 resolver 指向完整的名称表，
/// 随后做环路检测。组通过 resolver 在拨号时才查找成员。
pub struct Engine {
    rules: Arc<RuleEngine>,
    table: Arc<HandlerTable>,
    proxy_names: Vec<String>,
    group_names: Vec<String>,
    direct: Arc<dyn OutboundHandler>,
    reject: Arc<dyn OutboundHandler>,
    subscriptions: Vec<Arc<Subscription>>,
    default_policy: String,
    rule_set_interval: Duration,
}

impl Engine {
    pub fn build(config: &Config) -> Result<Self> {
        Self::build_with_factory(config, Arc::new(BuiltinOutboundFactory))
    }

    pub fn build_with_factory(config: &Config, factory: Arc<dyn OutboundFactory>) -> Result<Self> {
        let geoip: Arc<dyn GeoIpLookup> = match config.geoip_db.as_deref() {
            Some(path) => {
                let db = GeoIpDb::load(path)?;
                info!(path = path, "GeoIP database loaded");
                Arc::new(db)
            }
            None => Arc::new(GeoIpDb::uninitialized()),
        };
        let test_timeout = Duration::from_millis(config.test_timeout_ms);
        let fetch_timeout = Duration::from_secs(config.fetch_timeout_secs);

        // 第一步：叶子代理与组外壳，resolver 此时还查不到任何名称
        let proxies = OutboundManager::new(&config.proxies, factory.as_ref())?;
        let slot: Arc<OnceLock<Weak<HandlerTable>>> = Arc::new(OnceLock::new());
        let resolver: ProxyResolver = {
            let slot = slot.clone();
            Arc::new(move |name: &str| slot.get()?.upgrade()?.get(name).cloned())
        };

        let mut table: HandlerTable = proxies.list().clone();
        let mut group_names = Vec::with_capacity(config.proxy_groups.len());
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        for group_config in &config.proxy_groups {
            let group = build_group(group_config, resolver.clone(), proxies.names(), test_timeout)?;
            table.insert(group_config.name.clone(), group);
            group_names.push(group_config.name.clone());
            graph.insert(group_config.name.clone(), group_config.proxies.clone());
        }

        // 第二步：接线并检测环路
        let table = Arc::new(table);
        let _ = slot.set(Arc::downgrade(&table));
        validate_cycles(&graph)?;

        let rules = Arc::new(RuleEngine::new(geoip).with_fetch_timeout(fetch_timeout));
        rules.load_from_config(&config.rules)?;

        let mut subscriptions = Vec::new();
        for group_config in &config.proxy_groups {
            let Some(url) = group_config.policy_path.as_deref().filter(|u| !u.is_empty()) else {
                continue;
            };
            let Some(group) = table.get(&group_config.name) else {
                continue;
            };
            subscriptions.push(Arc::new(Subscription::new(
                url,
                Duration::from_secs(group_config.update_interval),
                group,
                factory.clone(),
                fetch_timeout,
            )?));
        }

        info!(
            proxies = proxies.names().len(),
            groups = group_names.len(),
            rules = rules.len(),
            subscriptions = subscriptions.len(),
            "engine built"
        );

        Ok(Self {
            rules,
            table,
            proxy_names: proxies.names().to_vec(),
            group_names,
            direct: Arc::new(DirectOutbound::new(DIRECT)),
            reject: Arc::new(RejectOutbound::new(REJECT)),
            subscriptions,
            default_policy: config.default_policy.clone(),
            rule_set_interval: Duration::from_secs(config.rule_set_interval),
        })
    }

    /// 启动全部后台任务：组健康检查、规则集刷新、订阅刷新
    pub fn start(&self) {
        for name in &self.group_names {
            if let Some(group) = self.table.get(name).and_then(|h| h.as_group()) {
                group.start();
            }
        }
        for set in self.rules.rule_sets() {
            set.start_refresh(self.rule_set_interval);
        }
        for sub in &self.subscriptions {
            sub.start();
        }
        info!("engine started");
    }

    /// 立即拉取全部规则集，失败只记录日志
    pub async fn refresh_rule_sets(&self) {
        for set in self.rules.rule_sets() {
            if let Err(e) = set.update().await {
                warn!(source = set.source(), error = %e, "rule-set fetch failed");
            }
        }
    }

    /// 立即刷新全部订阅，失败只记录日志
    pub async fn refresh_subscriptions(&self) {
        for sub in &self.subscriptions {
            if let Err(e) = sub.update().await {
                warn!(group = sub.group_name(), error = %e, "subscription update failed");
            }
        }
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn proxy_names(&self) -> &[String] {
        &self.proxy_names
    }

    pub fn group_names(&self) -> &[String] {
        &self.group_names
    }

    pub fn subscriptions(&self) -> &[Arc<Subscription>] {
        &self.subscriptions
    }

    /// 策略名 -> 出站；DIRECT / REJECT 不查表
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn OutboundHandler>> {
        match name {
            DIRECT => Ok(self.direct.clone()),
            REJECT => Ok(self.reject.clone()),
            _ => self
                .table
                .get(name)
                .cloned()
                .ok_or_else(|| RouterError::NotFound(name.to_string()).into()),
        }
    }

    /// 代理组；名称是叶子代理或不存在时返回 `None`
    pub fn group(&self, name: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.table.get(name).filter(|h| h.as_group().is_some()).cloned()
    }

    /// 规则匹配并解析到出站；无命中时使用默认策略
    pub fn route(&self, meta: &RequestMetadata) -> Result<Route> {
        let rule = self.rules.match_request(meta);
        let policy = match &rule {
            Some(rule) => rule.policy().to_string(),
            None => self.default_policy.clone(),
        };
        let handler = self.resolve(&policy)?;
        debug!(
            host = %meta.host,
            port = meta.port,
            policy = policy,
            matched = rule.is_some(),
            "routed"
        );
        Ok(Route {
            policy,
            rule,
            handler,
        })
    }

    /// 路由并拨号；失败原样返回给调用方，不做重试
    pub async fn dial(&self, meta: &RequestMetadata) -> Result<ProxyStream> {
        let network: Network = meta.network.parse()?;
        let route = self.route(meta)?;
        route.handler.dial(network, &meta.destination()).await
    }

    /// 立即对指定组测速
    pub async fn retest(&self, group: &str) -> Result<()> {
        let handler = self
            .group(group)
            .ok_or_else(|| RouterError::NotFound(group.to_string()))?;
        if let Some(view) = handler.as_group() {
            view.retest().await;
        }
        Ok(())
    }

    /// 手动选择组成员
    pub async fn select(&self, group: &str, member: &str) -> Result<()> {
        let handler = self
            .group(group)
            .ok_or_else(|| RouterError::NotFound(group.to_string()))?;
        match handler.as_group() {
            Some(view) => view.select(member).await,
            None => Err(RouterError::NotFound(group.to_string()).into()),
        }
    }

    /// 组的当前选择
    pub async fn now(&self, group: &str) -> Result<String> {
        let handler = self
            .group(group)
            .ok_or_else(|| RouterError::NotFound(group.to_string()))?;
        match handler.as_group() {
            Some(view) => Ok(view.now().await),
            None => Err(RouterError::NotFound(group.to_string()).into()),
        }
    }

    /// 停止全部后台任务并关闭出站
    pub async fn shutdown(&self) {
        for sub in &self.subscriptions {
            sub.close().await;
        }
        for set in self.rules.rule_sets() {
            set.close().await;
        }
        for (name, handler) in self.table.iter() {
            if let Err(e) = handler.close().await {
                debug!(name = name, error = %e, "close failed");
            }
        }
        info!("engine stopped");
    }
}
