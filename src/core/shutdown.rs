//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后取消根 token，正在进行的运行在下一个检查点以 Cancelled 退出
//! （轨迹照常结束并落盘）；等运行排空或超过宽限期后，再依次执行清理钩子（关闭执行池）。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::sandbox::PythonPool;

/// 关闭原因，仅用于日志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// 持有所有运行共享的根取消 token
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 各运行应使用它的 child_token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            tracing::info!(?reason, "shutdown requested, cancelling in-flight runs");
        }
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 运行排空后执行的清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 驱动应用直到结束或关闭，然后排空运行并执行清理
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 取消后等待运行退出的宽限期；已开始的工具调用不会被打断，应不小于工具超时
    drain_timeout: Duration,
    cleanup_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            drain_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 运行 app；关闭信号到达时不丢弃 app，而是等它在取消检查点退出
    pub async fn run<F>(&self, app: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(app);

        tokio::select! {
            _ = &mut app => {
                tracing::info!("application finished");
            }
            _ = self.manager.wait_for_shutdown() => {
                tracing::info!(drain_secs = self.drain_timeout.as_secs(), "draining in-flight runs");
                if tokio::time::timeout(self.drain_timeout, &mut app).await.is_err() {
                    tracing::warn!(drain_secs = self.drain_timeout.as_secs(), "runs did not drain in time");
                }
            }
        }

        self.run_cleanup().await;
    }

    pub async fn run_cleanup(&self) {
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.cleanup_timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "cleanup done"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(task = name, "cleanup timed out"),
            }
        }
    }
}

/// 关闭执行池并终止全部 worker 进程
pub struct PoolCleanup {
    pool: Arc<PythonPool>,
}

impl PoolCleanup {
    pub fn new(pool: Arc<PythonPool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for PoolCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "python_pool"
    }
}
