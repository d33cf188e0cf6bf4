use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::Result;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::common::{RouterError, TaskHandle};
use crate::config::subscription::parse_subscription;
use crate::proxy::group::LocalProxies;
use crate::proxy::OutboundHandler;

use super::outbound_manager::OutboundFactory;

/// 一次更新的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// 成员已替换为这些代理
    Updated(Vec<String>),
    /// 服务端返回 304，成员保持不变
    NotModified,
}

/// 订阅：定期拉取节点列表并整体替换目标组的成员
///
/// 只持有目标组的弱引用；组被释放后刷新循环自行退出。
pub struct Subscription {
    url: String,
    interval: Duration,
    group_name: String,
    group: Weak<dyn OutboundHandler>,
    factory: Arc<dyn OutboundFactory>,
    client: reqwest::Client,
    /// 上次成功响应的 ETag；锁同时保证同一时刻只有一次拉取
    etag: Mutex<Option<String>>,
    task: OnceLock<TaskHandle>,
}

impl Subscription {
    pub fn new(
        url: impl Into<String>,
        interval: Duration,
        group: &Arc<dyn OutboundHandler>,
        factory: Arc<dyn OutboundFactory>,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        if group.as_group().is_none() {
            return Err(RouterError::Config(format!(
                "subscription target '{}' is not a proxy group",
                group.name()
            ))
            .into());
        }
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            url: url.into(),
            interval,
            group_name: group.name().to_string(),
            group: Arc::downgrade(group),
            factory,
            client,
            etag: Mutex::new(None),
            task: OnceLock::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// 拉取并替换成员；任何失败都不改动现有成员
    pub async fn update(&self) -> Result<UpdateOutcome> {
        let mut etag = self.etag.lock().await;
        debug!(group = self.group_name, url = self.url, "subscription: fetching");

        let (body, new_etag) = match self.fetch(etag.as_deref()).await? {
            Some(fetched) => fetched,
            None => {
                debug!(group = self.group_name, "subscription not modified");
                return Ok(UpdateOutcome::NotModified);
            }
        };

        let mut names = Vec::new();
        let mut local = LocalProxies::new();
        let mut seen = HashSet::new();
        for node in parse_subscription(&body) {
            if !seen.insert(node.name.clone()) {
                debug!(group = self.group_name, proxy = node.name, "subscription: duplicate name skipped");
                continue;
            }
            match self.factory.build(&node) {
                Ok(handler) => {
                    names.push(node.name.clone());
                    local.insert(node.name, handler);
                }
                Err(e) => {
                    debug!(group = self.group_name, proxy = node.name, error = %e, "subscription: skip proxy");
                }
            }
        }
        if names.is_empty() {
            return Err(RouterError::Fetch(format!("{}: no usable proxies", self.url)).into());
        }

        let group = self
            .group
            .upgrade()
            .ok_or_else(|| RouterError::NotFound(self.group_name.clone()))?;
        let view = group
            .as_group()
            .ok_or_else(|| RouterError::NotFound(self.group_name.clone()))?;
        view.update_proxies(names.clone(), local).await;

        *etag = new_etag;
        info!(group = self.group_name, proxies = names.len(), "subscription updated");
        Ok(UpdateOutcome::Updated(names))
    }

    /// 返回 `None` 表示 304
    async fn fetch(&self, etag: Option<&str>) -> Result<Option<(String, Option<String>)>> {
        if let Some(path) = self.url.strip_prefix("file://") {
            let body = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| RouterError::Fetch(format!("{}: {}", self.url, e)))?;
            return Ok(Some((body, None)));
        }

        let mut request = self.client.get(&self.url);
        if let Some(tag) = etag {
            request = request.header(IF_NONE_MATCH, tag);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| RouterError::Fetch(format!("{}: {}", self.url, e)))?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(RouterError::Fetch(format!("{}: HTTP {}", self.url, resp.status())).into());
        }
        let new_etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .text()
            .await
            .map_err(|e| RouterError::Fetch(format!("{}: {}", self.url, e)))?;
        debug!(url = self.url, bytes = body.len(), "subscription fetched");
        Ok(Some((body, new_etag)))
    }

    /// 立即拉取一次，之后按间隔刷新；间隔为零时只拉取一次
    pub fn start(self: &Arc<Self>) {
        if self.task.get().is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.interval;
        let handle = TaskHandle::spawn(format!("subscription:{}", self.group_name), move |cancel| async move {
            let refresh = |weak: &Weak<Subscription>| {
                let sub = weak.upgrade();
                async move {
                    let Some(sub) = sub else { return false };
                    if let Err(e) = sub.update().await {
                        warn!(group = sub.group_name, url = sub.url, error = %e, "subscription update failed, keeping current proxies");
                    }
                    true
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return,
                alive = refresh(&weak) => if !alive { return },
            }
            if interval.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !refresh(&weak).await {
                            break;
                        }
                    }
                }
            }
        });
        let _ = self.task.set(handle);
    }

    pub async fn close(&self) {
        if let Some(task) = self.task.get() {
            task.shutdown().await;
        }
    }
}
