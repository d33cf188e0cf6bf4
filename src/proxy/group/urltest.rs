use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::common::{Address, ProxyStream, RouterError, TaskHandle, TaskSet};
use crate::proxy::{Network, OutboundHandler};

use super::health;
use super::{GroupBase, HealthOptions, LocalProxies, Membership, ProxyGroup};

/// 按测速结果和容差决定新的优胜者
///
/// 返回 `None` 表示保持当前选择。当前选择本轮测速失败时强制改选。
pub fn pick_winner<'a>(current: &str, results: &'a [(String, u64)], tolerance: u64) -> Option<&'a str> {
    let (best, best_latency) = results.iter().min_by_key(|(_, latency)| *latency)?;
    if current.is_empty() || best == current {
        return Some(best);
    }
    match results.iter().find(|(name, _)| name == current) {
        Some((_, current_latency))
            if (*best_latency as i64) > *current_latency as i64 - tolerance as i64 =>
        {
            None
        }
        _ => Some(best),
    }
}

struct UrlTestState {
    membership: Membership,
    /// 最近一轮成功的测速结果
    latencies: HashMap<String, u64>,
}

struct UrlTestInner {
    base: GroupBase,
    health: HealthOptions,
    tolerance: u64,
    state: RwLock<UrlTestState>,
    /// 成员更新后的补测
    retests: TaskSet,
}

impl UrlTestInner {
    async fn retest(&self) {
        let targets = {
            let state = self.state.read().await;
            self.base.test_targets(&state.membership)
        };
        if targets.is_empty() {
            return;
        }

        let results = health::test_members(targets, &self.health.url, self.health.timeout).await;
        let successes: Vec<(String, u64)> = results
            .into_iter()
            .filter_map(|(name, result)| result.ok().map(|latency| (name, latency)))
            .collect();

        let mut state = self.state.write().await;
        // 测速期间成员可能已被替换，只采纳仍在列表中的结果
        let successes: Vec<(String, u64)> = successes
            .into_iter()
            .filter(|(name, _)| state.membership.contains(name))
            .collect();
        state.latencies = successes.iter().cloned().collect();

        let winner = pick_winner(&state.membership.current, &successes, self.tolerance).map(str::to_string);
        match winner {
            Some(winner) if winner != state.membership.current => {
                info!(
                    group = self.base.name(),
                    from = state.membership.current,
                    to = winner,
                    latency = state.latencies.get(&winner).copied().unwrap_or_default(),
                    "url-test auto-switched"
                );
                state.membership.current = winner;
            }
            _ => {
                debug!(group = self.base.name(), current = state.membership.current, "url-test kept selection");
            }
        }
    }
}

/// 自动选择代理组（按延迟最低选择，带容差）
pub struct UrlTestGroup {
    inner: Arc<UrlTestInner>,
    task: OnceLock<TaskHandle>,
}

impl UrlTestGroup {
    pub fn new(base: GroupBase, members: Vec<String>, health: HealthOptions, tolerance: u64) -> Self {
        let current = members.first().cloned().unwrap_or_default();
        let name = base.name().to_string();
        Self {
            inner: Arc::new(UrlTestInner {
                base,
                health,
                tolerance,
                state: RwLock::new(UrlTestState {
                    membership: Membership::new(members, current),
                    latencies: HashMap::new(),
                }),
                retests: TaskSet::new(format!("url-test:{}:retests", name)),
            }),
            task: OnceLock::new(),
        }
    }

    /// 最近一轮成功测速的延迟
    pub async fn latencies(&self) -> HashMap<String, u64> {
        self.inner.state.read().await.latencies.clone()
    }
}

#[async_trait]
impl OutboundHandler for UrlTestGroup {
    fn name(&self) -> &str {
        self.inner.base.name()
    }

    fn kind(&self) -> &str {
        self.inner.base.kind()
    }

    async fn dial(&self, network: Network, target: &Address) -> Result<ProxyStream> {
        let picked = self.inner.state.read().await.membership.pick();
        let (name, local) =
            picked.ok_or_else(|| RouterError::NoSelection(self.name().to_string()))?;
        self.inner.base.safe_dial(&name, local, network, target).await
    }

    async fn test(&self, url: &str, timeout: Duration) -> Result<u64> {
        let picked = self.inner.state.read().await.membership.pick();
        self.inner.base.test_current(picked, url, timeout).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.task.get() {
            task.shutdown().await;
        }
        self.inner.retests.shutdown().await;
        Ok(())
    }

    fn as_group(&self) -> Option<&dyn ProxyGroup> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl ProxyGroup for UrlTestGroup {
    async fn members(&self) -> Vec<String> {
        self.inner.state.read().await.membership.members.clone()
    }

    async fn now(&self) -> String {
        self.inner.state.read().await.membership.current.clone()
    }

    async fn update_proxies(&self, names: Vec<String>, local: LocalProxies) {
        let names = self.inner.base.filter_members(names);
        {
            let mut state = self.inner.state.write().await;
            state.membership.replace(names, local);
            let membership = &state.membership;
            let kept: HashMap<String, u64> = state
                .latencies
                .iter()
                .filter(|(name, _)| membership.contains(name))
                .map(|(n, l)| (n.clone(), *l))
                .collect();
            state.latencies = kept;
            info!(
                group = self.name(),
                members = state.membership.members.len(),
                "proxy group membership updated"
            );
        }
        let inner = self.inner.clone();
        self.inner.retests.spawn(async move { inner.retest().await });
    }

    async fn retest(&self) {
        self.inner.retest().await;
    }

    fn start(&self) {
        if self.inner.health.interval.is_zero() || self.task.get().is_some() {
            return;
        }
        let inner = self.inner.clone();
        let handle = TaskHandle::every(
            format!("url-test:{}", self.name()),
            self.inner.health.interval,
            move || {
                let inner = inner.clone();
                async move { inner.retest().await }
            },
        );
        info!(group = self.name(), interval = ?self.inner.health.interval, "starting health check loop");
        let _ = self.task.set(handle);
    }
}
