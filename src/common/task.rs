use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// 后台任务句柄：取消令牌 + JoinHandle，关闭时取消并等待退出
pub struct TaskHandle {
    name: String,
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    /// 启动一个可取消任务；`f` 收到子令牌，应在令牌取消时尽快返回
    pub fn spawn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(f(cancel.clone()));
        Self {
            name: name.into(),
            cancel,
            join: Mutex::new(Some(join)),
        }
    }

    /// 固定间隔循环：每个 tick 执行一次 `tick()`，首次执行在一个间隔之后
    pub fn every<F, Fut>(name: impl Into<String>, interval: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, move |cancel| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // 跳过首次立即触发
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 取消并等待任务结束（可重复调用）
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let join = self.join.lock().await.take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                if !e.is_cancelled() {
                    debug!(task = self.name, error = %e, "background task ended abnormally");
                }
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 一次性后台任务集合（如成员更新后的补测）
///
/// 关闭后不再接受新任务；`shutdown` 取消仍在运行的任务并等待它们退出。
pub struct TaskSet {
    name: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TaskSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// 提交任务；已关闭时丢弃并返回 false
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            debug!(tasks = self.name, "task set closed, job dropped");
            return false;
        }
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = fut => {}
            }
        });
        true
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 取消并等待全部任务结束（可重复调用）
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
