use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::common::{Address, ProxyStream, RouterError};
use crate::proxy::{Network, OutboundHandler};

use super::{GroupBase, LocalProxies, Membership, ProxyGroup};

/// 手动选择代理组
pub struct SelectorGroup {
    base: GroupBase,
    state: RwLock<Membership>,
}

impl SelectorGroup {
    /// `selected` 仅在属于成员列表时生效，否则默认第一个成员
    pub fn new(base: GroupBase, members: Vec<String>, selected: Option<&str>) -> Self {
        let current = match selected {
            Some(s) if members.iter().any(|m| m == s) => s.to_string(),
            _ => members.first().cloned().unwrap_or_default(),
        };
        Self {
            base,
            state: RwLock::new(Membership::new(members, current)),
        }
    }

    /// 切换当前选择；名字不在成员列表中时报错且不改变选择
    pub async fn set_current(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.contains(name) {
            return Err(RouterError::NotFound(name.to_string()).into());
        }
        state.current = name.to_string();
        info!(group = self.base.name(), selected = name, "proxy group selection changed");
        Ok(())
    }
}

#[async_trait]
impl OutboundHandler for SelectorGroup {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> &str {
        self.base.kind()
    }

    async fn dial(&self, network: Network, target: &Address) -> Result<ProxyStream> {
        let picked = self.state.read().await.pick();
        let (name, local) =
            picked.ok_or_else(|| RouterError::NoSelection(self.base.name().to_string()))?;
        self.base.safe_dial(&name, local, network, target).await
    }

    async fn test(&self, url: &str, timeout: Duration) -> Result<u64> {
        let picked = self.state.read().await.pick();
        self.base.test_current(picked, url, timeout).await
    }

    fn as_group(&self) -> Option<&dyn ProxyGroup> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl ProxyGroup for SelectorGroup {
    async fn members(&self) -> Vec<String> {
        self.state.read().await.members.clone()
    }

    async fn now(&self) -> String {
        self.state.read().await.current.clone()
    }

    async fn update_proxies(&self, names: Vec<String>, local: LocalProxies) {
        let names = self.base.filter_members(names);
        let mut state = self.state.write().await;
        state.replace(names, local);
        info!(
            group = self.base.name(),
            members = state.members.len(),
            current = state.current,
            "proxy group membership updated"
        );
    }

    async fn select(&self, name: &str) -> Result<()> {
        self.set_current(name).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::super::testing::*;
    use super::*;
    use crate::common::RouterErrorKind;

    fn group(members: &[&str], selected: Option<&str>) -> SelectorGroup {
        let proxies: Vec<_> = members.iter().map(|m| MockOutbound::new(m, Ok(10))).collect();
        let base = GroupBase::new("Proxy", "select", resolver_of(&proxies), None);
        SelectorGroup::new(base, names(members), selected)
    }

    #[tokio::test]
    async fn initial_selection() {
        assert_eq!(group(&["a", "b"], None).now().await, "a");
        assert_eq!(group(&["a", "b"], Some("b")).now().await, "b");
        assert_eq!(group(&["a", "b"], Some("zz")).now().await, "a");
        assert_eq!(group(&[], None).now().await, "");
    }

    #[tokio::test]
    async fn set_current_unknown_leaves_selection() {
        let g = group(&["a", "b"], None);
        g.set_current("b").await.unwrap();
        assert_eq!(g.now().await, "b");

        let err = g.set_current("c").await.unwrap_err();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::NotFound);
        assert_eq!(g.now().await, "b");
    }

    #[tokio::test]
    async fn empty_group_dial_is_error() {
        let g = group(&[], None);
        let err = g
            .dial(Network::Tcp, &Address::new("x.test", 80))
            .await
            .err()
            .unwrap();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::NoSelection);
    }

    #[tokio::test]
    async fn update_proxies_falls_back_to_first() {
        let g = group(&["a", "b"], Some("b"));
        g.update_proxies(names(&["c", "a"]), HashMap::new()).await;
        assert_eq!(g.now().await, "c");
        assert_eq!(g.members().await, names(&["c", "a"]));
    }

    #[tokio::test]
    async fn dial_and_test_use_current() {
        let a = MockOutbound::new("a", Ok(42));
        let b = MockOutbound::new("b", Ok(7));
        let base = GroupBase::new("Proxy", "select", resolver_of(&[a.clone(), b.clone()]), None);
        let g = SelectorGroup::new(base, names(&["a", "b"]), None);

        g.select("b").await.unwrap();
        g.dial(Network::Tcp, &Address::new("x.test", 80)).await.unwrap();
        assert_eq!(b.dial_count(), 1);
        assert_eq!(a.dial_count(), 0);
        assert_eq!(
            g.test("http://x.test/", Duration::from_secs(1)).await.unwrap(),
            7
        );
    }
}
