use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::common::{RouterError, TaskHandle};

use super::geoip::GeoIpLookup;
use super::metadata::RequestMetadata;
use super::parser::RuleParser;
use super::rules::RuleKind;

/// 远程下载的客户端超时
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// 规则集默认刷新间隔（1 天）
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(86400);

/// 远程规则集
///
/// 成员列表从 URL（或 `file://` 路径）拉取，逐行解析为不带策略的谓词。
/// 刷新时整表替换，匹配方只会看到旧表或新表。
pub struct RuleSet {
    source: String,
    geoip: Arc<dyn GeoIpLookup>,
    client: reqwest::Client,
    members: RwLock<Arc<Vec<RuleKind>>>,
    refresh: OnceLock<TaskHandle>,
}

impl RuleSet {
    pub fn new(source: &str, geoip: Arc<dyn GeoIpLookup>, fetch_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            source: source.to_string(),
            geoip,
            client,
            members: RwLock::new(Arc::new(Vec::new())),
            refresh: OnceLock::new(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 任一成员命中即命中；整个扫描持有同一个读锁
    pub fn matches(&self, meta: &RequestMetadata) -> bool {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        members.iter().any(|m| m.matches(meta))
    }

    fn snapshot(&self) -> Arc<Vec<RuleKind>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 解析文本并替换成员列表，无效行跳过；返回有效成员数
    pub fn load_text(&self, text: &str) -> usize {
        let parser = RuleParser::new(self.geoip.clone());
        let mut members = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            match parser.parse_member(line) {
                Ok(Some(kind)) => members.push(kind),
                Ok(None) => {}
                Err(e) => {
                    debug!(source = %self.source, line = lineno + 1, error = %e, "skip invalid rule-set line");
                }
            }
        }
        let count = members.len();
        *self.members.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(members);
        count
    }

    async fn fetch(&self) -> Result<String> {
        if let Some(path) = self.source.strip_prefix("file://") {
            return tokio::fs::read_to_string(path)
                .await
                .map_err(|e| RouterError::Fetch(format!("{}: {}", self.source, e)).into());
        }

        let resp = self
            .client
            .get(&self.source)
            .send()
            .await
            .map_err(|e| RouterError::Fetch(format!("{}: {}", self.source, e)))?;
        if !resp.status().is_success() {
            return Err(RouterError::Fetch(format!("{}: HTTP {}", self.source, resp.status())).into());
        }
        resp.text()
            .await
            .map_err(|e| RouterError::Fetch(format!("{}: {}", self.source, e)).into())
    }

    /// 拉取并替换；失败时保留旧列表
    pub async fn update(&self) -> Result<usize> {
        let text = self.fetch().await?;
        let count = self.load_text(&text);
        info!(source = %self.source, rules = count, "rule-set loaded");
        Ok(count)
    }

    /// 启动刷新循环：先立即拉取一次，之后按间隔刷新；重复调用无效
    pub fn start_refresh(self: &Arc<Self>, interval: Duration) {
        if self.refresh.get().is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let name = format!("rule-set {}", self.source);
        let handle = TaskHandle::spawn(name, move |cancel| async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(set) = weak.upgrade() else { break };
                        if let Err(e) = set.update().await {
                            warn!(source = %set.source, error = %e, "rule-set refresh failed, keeping previous rules");
                        }
                    }
                }
            }
        });
        let _ = self.refresh.set(handle);
    }

    pub async fn close(&self) {
        if let Some(handle) = self.refresh.get() {
            handle.shutdown().await;
        }
    }
}
