//! 任务调度：工具并发许可与后台任务
//!
//! 工具执行使用 Semaphore 限制并发；运行结束后的记忆提取等作为后台任务分离执行，不阻塞回复。

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::core::AgentError;

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// 任务调度器
pub struct TaskScheduler {
    /// 工具并发限制（默认 3）
    tool_semaphore: Arc<Semaphore>,
    /// 尚未结束的后台任务数
    background_in_flight: Arc<AtomicUsize>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
            background_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 获取工具执行许可
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::InvalidState("tool semaphore closed".into()))
    }

    /// 提交分离的后台任务；调用方不等待其完成
    pub fn spawn_background<F>(&self, label: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = TaskId::new();
        let counter = Arc::clone(&self.background_in_flight);
        counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(task_id = id.0, label, "background task submitted");
        tokio::spawn(async move {
            fut.await;
            counter.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(task_id = id.0, label, "background task finished");
        })
    }

    /// 当前未完成的后台任务数
    pub fn background_in_flight(&self) -> usize {
        self.background_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tool_permits_are_bounded() {
        let scheduler = TaskScheduler::new(1);
        let first = scheduler.acquire_tool().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), scheduler.acquire_tool()).await;
        assert!(second.is_err());
        drop(first);
        assert!(scheduler.acquire_tool().await.is_ok());
    }

    #[tokio::test]
    async fn test_background_task_is_detached() {
        let scheduler = TaskScheduler::default();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = scheduler.spawn_background("test", async move {
            let _ = rx.await;
        });
        assert_eq!(scheduler.background_in_flight(), 1);
        let _ = tx.send(());
        handle.await.unwrap();
        assert_eq!(scheduler.background_in_flight(), 0);
    }
}
