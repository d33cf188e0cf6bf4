use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use crate::common::{Address, ProxyStream, RouterError, TaskHandle, TaskSet};
use crate::proxy::{Network, OutboundHandler};

use super::health;
use super::{GroupBase, HealthOptions, LocalProxies, Membership, ProxyGroup};

/// 测速失败或尚未测速时的延迟
pub const SENTINEL_LATENCY_MS: u64 = 9999;
/// 每次失败计入的分数
pub const FAILURE_PENALTY_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberStats {
    pub latency_ms: u64,
    pub failures: u32,
}

impl Default for MemberStats {
    fn default() -> Self {
        Self {
            latency_ms: SENTINEL_LATENCY_MS,
            failures: 0,
        }
    }
}

impl MemberStats {
    /// 分数越低越好，失败次数压过任何延迟差
    pub fn score(&self) -> u64 {
        self.latency_ms + self.failures as u64 * FAILURE_PENALTY_MS
    }
}

/// 按成员顺序挑出分数最低者，同分取靠前的
pub fn pick_best<'a>(members: &'a [String], stats: &HashMap<String, MemberStats>) -> Option<&'a str> {
    members
        .iter()
        .filter_map(|m| stats.get(m).map(|s| (m, s.score())))
        .min_by_key(|(_, score)| *score)
        .map(|(m, _)| m.as_str())
}

struct SmartState {
    membership: Membership,
    stats: HashMap<String, MemberStats>,
}

impl SmartState {
    fn evaluate(&mut self, group: &str) {
        let Some(best) = pick_best(&self.membership.members, &self.stats) else {
            return;
        };
        if best != self.membership.current {
            info!(
                group = group,
                from = self.membership.current,
                to = best,
                score = self.stats.get(best).map(MemberStats::score).unwrap_or_default(),
                "smart group re-evaluated"
            );
            self.membership.current = best.to_string();
        }
    }

    fn sync_stats(&mut self) {
        let members = &self.membership.members;
        self.stats.retain(|name, _| members.contains(name));
        for m in members {
            self.stats.entry(m.clone()).or_default();
        }
    }
}

struct SmartInner {
    base: GroupBase,
    health: HealthOptions,
    evaluate_before_use: bool,
    state: RwLock<SmartState>,
    first_evaluation: OnceCell<()>,
    /// 补测与失败后的重新评估
    jobs: TaskSet,
}

impl SmartInner {
    async fn retest(&self) {
        let targets = {
            let state = self.state.read().await;
            self.base.test_targets(&state.membership)
        };
        if targets.is_empty() {
            return;
        }

        let results = health::test_members(targets, &self.health.url, self.health.timeout).await;

        let mut state = self.state.write().await;
        for (name, result) in results {
            // 测速期间被移除的成员不再有统计项
            let Some(stat) = state.stats.get_mut(&name) else {
                continue;
            };
            match result {
                Ok(latency) => stat.latency_ms = latency,
                Err(_) => {
                    stat.failures += 1;
                    stat.latency_ms = SENTINEL_LATENCY_MS;
                }
            }
        }
        state.evaluate(self.base.name());
    }

    async fn evaluate(&self) {
        self.state.write().await.evaluate(self.base.name());
    }

    /// 记录一次拨号结果；当前选择失败时后台重新评估
    async fn record_dial(self: &Arc<Self>, name: &str, ok: bool) {
        let mut state = self.state.write().await;
        let is_current = state.membership.current == name;
        let Some(stat) = state.stats.get_mut(name) else {
            return;
        };
        if ok {
            stat.failures = stat.failures.saturating_sub(1);
            return;
        }
        stat.failures += 1;
        debug!(group = self.base.name(), member = name, failures = stat.failures, "smart group dial failed");
        if is_current {
            let inner = self.clone();
            self.jobs.spawn(async move { inner.evaluate().await });
        }
    }
}

/// 智能选择代理组：持续按 延迟 + 失败次数 打分
pub struct SmartGroup {
    inner: Arc<SmartInner>,
    task: OnceLock<TaskHandle>,
}

impl SmartGroup {
    /// `evaluate_before_use` 时不预选成员，首次拨号等待一次完整评估
    pub fn new(
        base: GroupBase,
        members: Vec<String>,
        health: HealthOptions,
        evaluate_before_use: bool,
    ) -> Self {
        let current = if evaluate_before_use {
            String::new()
        } else {
            members.first().cloned().unwrap_or_default()
        };
        let mut state = SmartState {
            membership: Membership::new(members, current),
            stats: HashMap::new(),
        };
        state.sync_stats();
        let name = base.name().to_string();
        Self {
            inner: Arc::new(SmartInner {
                base,
                health,
                evaluate_before_use,
                state: RwLock::new(state),
                first_evaluation: OnceCell::new(),
                jobs: TaskSet::new(format!("smart:{}:jobs", name)),
            }),
            task: OnceLock::new(),
        }
    }

    pub async fn stats(&self) -> HashMap<String, MemberStats> {
        self.inner.state.read().await.stats.clone()
    }

    async fn ensure_evaluated(&self) {
        if !self.inner.evaluate_before_use {
            return;
        }
        let inner = self.inner.clone();
        self.inner
            .first_evaluation
            .get_or_init(|| async move { inner.retest().await })
            .await;
    }
}

#[async_trait]
impl OutboundHandler for SmartGroup {
    fn name(&self) -> &str {
        self.inner.base.name()
    }

    fn kind(&self) -> &str {
        self.inner.base.kind()
    }

    async fn dial(&self, network: Network, target: &Address) -> Result<ProxyStream> {
        self.ensure_evaluated().await;
        let picked = self.inner.state.read().await.membership.pick();
        let (name, local) =
            picked.ok_or_else(|| RouterError::NoSelection(self.name().to_string()))?;

        let result = self.inner.base.safe_dial(&name, local, network, target).await;
        self.inner.record_dial(&name, result.is_ok()).await;
        result
    }

    async fn test(&self, url: &str, timeout: Duration) -> Result<u64> {
        self.ensure_evaluated().await;
        let picked = self.inner.state.read().await.membership.pick();
        self.inner.base.test_current(picked, url, timeout).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.task.get() {
            task.shutdown().await;
        }
        self.inner.jobs.shutdown().await;
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
impl ProxyGroup for SmartGroup {
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
            state.sync_stats();
            info!(
                group = self.name(),
                members = state.membership.members.len(),
                "proxy group membership updated"
            );
        }
        let inner = self.inner.clone();
        self.inner.jobs.spawn(async move { inner.retest().await });
    }

    async fn retest(&self) {
        self.inner.retest().await;
    }

    fn start(&self) {
        if self.task.get().is_some() {
            return;
        }
        if self.inner.evaluate_before_use {
            let inner = self.inner.clone();
            self.inner.jobs.spawn(async move {
                let runner = inner.clone();
                inner
                    .first_evaluation
                    .get_or_init(|| async move { runner.retest().await })
                    .await;
            });
        }
        if self.inner.health.interval.is_zero() {
            return;
        }
        let inner = self.inner.clone();
        let handle = TaskHandle::every(
            format!("smart:{}", self.name()),
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
