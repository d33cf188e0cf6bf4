pub mod health;
pub mod relay;
pub mod selector;
pub mod smart;
pub mod urltest;
pub mod validate;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::common::{Address, ProxyStream, RouterError};
use crate::config::types::ProxyGroupConfig;
use crate::proxy::outbound::{DirectOutbound, RejectOutbound};
use crate::proxy::{Network, OutboundHandler, ProxyResolver, DIRECT, REJECT};

pub use validate::validate_cycles;

/// 订阅等来源提供的组内私有出站，按名称优先于 resolver 查找
pub type LocalProxies = HashMap<String, Arc<dyn OutboundHandler>>;

/// 代理组视图：成员、当前选择、成员替换与测速
#[async_trait]
pub trait ProxyGroup: Send + Sync {
    async fn members(&self) -> Vec<String>;

    /// 当前选择；未选择时为空串
    async fn now(&self) -> String;

    /// 整体替换成员列表（先经过组的过滤正则）
    async fn update_proxies(&self, names: Vec<String>, local: LocalProxies);

    /// 立即对所有成员测速并重新选择
    async fn retest(&self) {}

    /// 手动选择成员，只有 select 组支持
    async fn select(&self, name: &str) -> Result<()> {
        let _ = name;
        Err(RouterError::Unsupported("manual selection on this group type".into()).into())
    }

    /// 启动后台健康检查循环（如有）
    fn start(&self) {}
}

/// 成员列表与当前选择，受组锁保护
pub struct Membership {
    pub members: Vec<String>,
    pub local: LocalProxies,
    pub current: String,
}

impl Membership {
    pub fn new(members: Vec<String>, current: String) -> Self {
        Self {
            members,
            local: HashMap::new(),
            current,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.iter().any(|m| m == name)
    }

    /// 替换成员；原选择不在新列表中时回落到第一个成员（空列表则清空）
    pub fn replace(&mut self, members: Vec<String>, local: LocalProxies) {
        self.members = members;
        self.local = local;
        if !self.contains(&self.current) {
            self.current = self.members.first().cloned().unwrap_or_default();
        }
    }

    /// 取出当前选择及其本地出站；无选择时返回 None
    pub fn pick(&self) -> Option<(String, Option<Arc<dyn OutboundHandler>>)> {
        if self.current.is_empty() {
            return None;
        }
        Some((self.current.clone(), self.local.get(&self.current).cloned()))
    }

    /// 每个成员名连同其本地出站（若有）
    pub fn entries(&self) -> Vec<(String, Option<Arc<dyn OutboundHandler>>)> {
        self.members
            .iter()
            .map(|m| (m.clone(), self.local.get(m).cloned()))
            .collect()
    }
}

/// 各类代理组共享的部分：名称、类型、resolver、过滤正则
pub struct GroupBase {
    name: String,
    kind: &'static str,
    resolver: ProxyResolver,
    filter: Option<Regex>,
    direct: Arc<dyn OutboundHandler>,
    reject: Arc<dyn OutboundHandler>,
}

impl GroupBase {
    pub fn new(
        name: impl Into<String>,
        kind: &'static str,
        resolver: ProxyResolver,
        filter: Option<Regex>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            resolver,
            filter,
            direct: Arc::new(DirectOutbound::new(DIRECT)),
            reject: Arc::new(RejectOutbound::new(REJECT)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn filter_members(&self, names: Vec<String>) -> Vec<String> {
        match &self.filter {
            Some(re) => names.into_iter().filter(|n| re.is_match(n)).collect(),
            None => names,
        }
    }

    /// 名称 -> 出站：保留字优先，其次本地出站，最后 resolver
    pub fn resolve(
        &self,
        name: &str,
        local: Option<Arc<dyn OutboundHandler>>,
    ) -> Result<Arc<dyn OutboundHandler>> {
        match name {
            DIRECT => Ok(self.direct.clone()),
            REJECT => Ok(self.reject.clone()),
            _ => local
                .or_else(|| (self.resolver)(name))
                .ok_or_else(|| RouterError::NotFound(name.to_string()).into()),
        }
    }

    pub async fn safe_dial(
        &self,
        child: &str,
        local: Option<Arc<dyn OutboundHandler>>,
        network: Network,
        target: &Address,
    ) -> Result<ProxyStream> {
        let handler = self.resolve(child, local)?;
        debug!(group = self.name, member = child, target = %target, "group dial");
        handler.dial(network, target).await
    }

    /// 对当前选择执行测速
    pub async fn test_current(
        &self,
        picked: Option<(String, Option<Arc<dyn OutboundHandler>>)>,
        url: &str,
        timeout: Duration,
    ) -> Result<u64> {
        let (name, local) = picked.ok_or_else(|| RouterError::NoSelection(self.name.clone()))?;
        self.resolve(&name, local)?.test(url, timeout).await
    }

    /// 解析全部成员，供并发测速使用；解析失败记为 None
    pub fn test_targets(
        &self,
        membership: &Membership,
    ) -> Vec<(String, Option<Arc<dyn OutboundHandler>>)> {
        membership
            .entries()
            .into_iter()
            .map(|(name, local)| {
                let handler = self.resolve(&name, local).ok();
                (name, handler)
            })
            .collect()
    }
}

/// 测速类组的参数
#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub url: String,
    /// 为零时不启动周期测速
    pub interval: Duration,
    pub timeout: Duration,
}

/// 按配置构建代理组
///
/// `all_proxies` 为全部叶子代理名（配置顺序），用于 include-all-proxies。
/// 成员名此时不做解析，拨号时才经 resolver 查找。
pub fn build_group(
    config: &ProxyGroupConfig,
    resolver: ProxyResolver,
    all_proxies: &[String],
    test_timeout: Duration,
) -> Result<Arc<dyn OutboundHandler>> {
    let mut members = config.proxies.clone();
    if config.include_all_proxies {
        let mut seen: HashSet<String> = members.iter().cloned().collect();
        for name in all_proxies {
            if seen.insert(name.clone()) {
                members.push(name.clone());
            }
        }
    }

    let filter = match config.policy_regex_filter.as_deref() {
        Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern).map_err(|e| {
            RouterError::Config(format!(
                "proxy-group '{}': invalid policy-regex-filter '{}': {}",
                config.name, pattern, e
            ))
        })?),
        _ => None,
    };

    let health = HealthOptions {
        url: config
            .url
            .clone()
            .unwrap_or_else(|| health::DEFAULT_TEST_URL.to_string()),
        interval: Duration::from_secs(config.interval),
        timeout: test_timeout,
    };

    let kind = config.group_type.to_ascii_lowercase();
    let handler: Arc<dyn OutboundHandler> = match kind.as_str() {
        "select" | "selector" => {
            let base = GroupBase::new(&config.name, "select", resolver, filter);
            let members = base.filter_members(members);
            Arc::new(selector::SelectorGroup::new(
                base,
                members,
                config.selected.as_deref(),
            ))
        }
        "url-test" => {
            let base = GroupBase::new(&config.name, "url-test", resolver, filter);
            let members = base.filter_members(members);
            Arc::new(urltest::UrlTestGroup::new(
                base,
                members,
                health,
                config.tolerance,
            ))
        }
        "smart" => {
            let base = GroupBase::new(&config.name, "smart", resolver, filter);
            let members = base.filter_members(members);
            Arc::new(smart::SmartGroup::new(
                base,
                members,
                health,
                config.evaluate_before_use,
            ))
        }
        "relay" => {
            let base = GroupBase::new(&config.name, "relay", resolver, filter);
            let members = base.filter_members(members);
            Arc::new(relay::RelayGroup::new(base, members))
        }
        other => {
            return Err(RouterError::Config(format!(
                "proxy-group '{}': unsupported group type '{}'",
                config.name, other
            ))
            .into())
        }
    };

    debug!(group = config.name, kind = handler.kind(), "proxy group built");
    Ok(handler)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn group_config(yaml: &str) -> ProxyGroupConfig {
        serde_yml::from_str(yaml).unwrap()
    }

    #[test]
    fn membership_replace_keeps_or_resets_current() {
        let mut m = Membership::new(names(&["a", "b"]), "b".into());
        m.replace(names(&["b", "c"]), HashMap::new());
        assert_eq!(m.current, "b");

        m.replace(names(&["c", "d"]), HashMap::new());
        assert_eq!(m.current, "c");

        m.replace(Vec::new(), HashMap::new());
        assert_eq!(m.current, "");
        assert!(m.pick().is_none());
    }

    #[tokio::test]
    async fn safe_dial_handles_reserved_and_missing() {
        let a = MockOutbound::new("a", Ok(10));
        let base = GroupBase::new("g", "select", resolver_of(&[a.clone()]), None);

        let err = base
            .safe_dial("REJECT", None, Network::Tcp, &Address::new("x.test", 80))
            .await
            .err()
            .unwrap();
        assert_eq!(
            RouterError::classify(&err),
            crate::common::RouterErrorKind::Rejected
        );

        let err = base
            .safe_dial("ghost", None, Network::Tcp, &Address::new("x.test", 80))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "proxy 'ghost' not found");

        base.safe_dial("a", None, Network::Tcp, &Address::new("x.test", 80))
            .await
            .unwrap();
        assert_eq!(a.dial_count(), 1);
    }

    #[tokio::test]
    async fn local_proxies_shadow_resolver() {
        let shared = MockOutbound::new("n1", Ok(10));
        let local = MockOutbound::new("n1", Ok(10));
        let base = GroupBase::new("g", "select", resolver_of(&[shared.clone()]), None);
        base.safe_dial(
            "n1",
            Some(local.clone() as Arc<dyn OutboundHandler>),
            Network::Tcp,
            &Address::new("x.test", 80),
        )
        .await
        .unwrap();
        assert_eq!(local.dial_count(), 1);
        assert_eq!(shared.dial_count(), 0);
    }

    #[test]
    fn filter_applies_to_candidates() {
        let base = GroupBase::new(
            "g",
            "select",
            resolver_of(&[]),
            Some(Regex::new("^HK").unwrap()),
        );
        assert_eq!(
            base.filter_members(names(&["HK-1", "US-1", "HK-2"])),
            names(&["HK-1", "HK-2"])
        );
    }

    #[tokio::test]
    async fn build_group_include_all_and_filter() {
        let cfg = group_config(
            "name: Auto\ntype: select\nproxies: [DIRECT, HK-1]\ninclude-all-proxies: true\npolicy-regex-filter: '^(HK|DIRECT)'\n",
        );
        let all = names(&["HK-1", "HK-2", "US-1"]);
        let g = build_group(&cfg, resolver_of(&[]), &all, Duration::from_secs(1)).unwrap();
        let group = g.as_group().unwrap();
        assert_eq!(group.members().await, names(&["DIRECT", "HK-1", "HK-2"]));
        assert_eq!(group.now().await, "DIRECT");
        assert_eq!(g.kind(), "select");
    }

    #[test]
    fn build_group_rejects_bad_regex_and_type() {
        let cfg = group_config("name: G\ntype: select\nproxies: [a]\npolicy-regex-filter: '('\n");
        let err = build_group(&cfg, resolver_of(&[]), &[], Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid policy-regex-filter"));

        let cfg = group_config("name: G\ntype: load-balance\nproxies: [a]\n");
        let err = build_group(&cfg, resolver_of(&[]), &[], Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("unsupported group type"));
    }
}
