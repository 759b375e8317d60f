//! Python 执行池
//!
//! 预先启动 `size` 个常驻 worker。空闲 worker 放在互斥保护的队列里，Semaphore 的许可数与队列长度一致，
//! 兼作获取信号量：先拿许可再出队，入队后再归还许可。
//!
//! ```text
//! PythonPool
//! ├─ idle:  [Worker1, Worker2, ...]   (空闲，可租用)
//! ├─ leased                            (执行中，由 Lease 独占)
//! └─ replacing                         (失败后异步替换中)
//! ```
//!
//! 失败（超时 / 传输错误 / 进程退出）的 worker 不会回到空闲队列，而是被终止并异步替换，
//! 池大小在替换完成后恢复。

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::core::PoolError;
use crate::sandbox::protocol::WorkerRequest;
use crate::sandbox::worker::Worker;

pub const DEFAULT_POOL_SIZE: usize = 2;

/// 替换 worker 的重试次数
const REPLACE_ATTEMPTS: u32 = 3;
const REPLACE_BACKOFF: Duration = Duration::from_millis(500);

/// 执行池参数
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub python_path: String,
    pub size: usize,
    pub acquire_timeout: Duration,
    pub exec_timeout: Duration,
    pub maintenance_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            python_path: "python3".to_string(),
            size: DEFAULT_POOL_SIZE,
            acquire_timeout: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(120),
            maintenance_interval: Duration::from_secs(300),
        }
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(cfg: &PoolConfig) -> Self {
        Self {
            python_path: cfg.python_path.clone(),
            size: cfg.size,
            acquire_timeout: Duration::from_secs(cfg.acquire_timeout_secs),
            exec_timeout: Duration::from_secs(cfg.exec_timeout_secs),
            maintenance_interval: Duration::from_secs(cfg.maintenance_interval_secs.max(1)),
        }
    }
}

/// 池状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    /// 空闲队列长度
    pub idle: usize,
    /// 存活或正在替换中的 worker 数
    pub live: usize,
    pub closed: bool,
}

struct Shared {
    options: PoolOptions,
    size: usize,
    idle: Mutex<VecDeque<Worker>>,
    /// 许可数 == 空闲队列长度
    available: Semaphore,
    closed: CancellationToken,
    live: AtomicUsize,
    next_id: AtomicUsize,
}

impl Shared {
    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 归还健康的 worker；池已关闭则直接终止
    async fn release(&self, worker: Worker) {
        let mut idle = self.idle.lock().await;
        if self.closed.is_cancelled() {
            drop(idle);
            worker.terminate().await;
            return;
        }
        idle.push_back(worker);
        drop(idle);
        self.available.add_permits(1);
    }

    /// 取出一个空闲 worker（不等待）
    async fn try_take(&self) -> Option<Worker> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.idle.lock().await.pop_front()
    }
}

/// 异步替换：终止旧进程，启动新 worker 并放回空闲队列
fn schedule_replacement(shared: &Arc<Shared>, stale: Option<Worker>) {
    let shared = Arc::clone(shared);
    let spawn = async move {
        if let Some(worker) = stale {
            worker.terminate().await;
        }
        for attempt in 1..=REPLACE_ATTEMPTS {
            if shared.closed.is_cancelled() {
                shared.live.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            let id = shared.next_id();
            match Worker::spawn(id, &shared.options.python_path) {
                Ok(worker) => {
                    tracing::info!(worker_id = id, "python worker replaced");
                    shared.release(worker).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "failed to spawn replacement worker");
                    tokio::time::sleep(REPLACE_BACKOFF * attempt).await;
                }
            }
        }
        // 放弃；由维护任务补齐
        shared.live.fetch_sub(1, Ordering::SeqCst);
        tracing::error!("giving up on worker replacement, pool is short-handed");
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(spawn);
        }
        Err(_) => tracing::warn!("no runtime available for worker replacement"),
    }
}

/// 一次独占租约；未被显式归还或丢弃时（如调用方 future 被取消）按失败处理
struct Lease {
    worker: Option<Worker>,
    shared: Arc<Shared>,
}

impl Lease {
    fn worker(&mut self) -> Result<&mut Worker, PoolError> {
        self.worker
            .as_mut()
            .ok_or_else(|| PoolError::Transport("lease already released".into()))
    }

    /// 成功后仍 ready 且进程存活才可回到空闲队列
    fn reusable(&mut self) -> bool {
        match self.worker.as_mut() {
            Some(worker) => worker.is_ready() && !worker.has_exited(),
            None => false,
        }
    }

    async fn release(mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.touch();
            self.shared.release(worker).await;
        }
    }

    /// 标记 not ready，立即 kill，并异步替换
    fn discard(mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.start_kill();
            schedule_replacement(&self.shared, Some(worker));
        }
    }

    async fn terminate(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.terminate().await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            tracing::warn!(worker_id = worker.id, "worker lease dropped mid-job, replacing");
            worker.start_kill();
            schedule_replacement(&self.shared, Some(worker));
        }
    }
}

/// Python 常驻 worker 执行池
pub struct PythonPool {
    shared: Arc<Shared>,
}

impl PythonPool {
    /// 启动 `size` 个 worker（0 视为默认值 2）与周期维护任务
    pub async fn new(options: PoolOptions) -> Result<Self, PoolError> {
        let size = if options.size == 0 { DEFAULT_POOL_SIZE } else { options.size };
        tracing::info!(size, python = %options.python_path, "initializing python pool");

        let mut workers = VecDeque::with_capacity(size);
        for id in 0..size {
            match Worker::spawn(id, &options.python_path) {
                Ok(worker) => workers.push_back(worker),
                Err(e) => {
                    join_all(workers.into_iter().map(Worker::terminate)).await;
                    return Err(e);
                }
            }
        }

        let shared = Arc::new(Shared {
            size,
            idle: Mutex::new(workers),
            available: Semaphore::new(size),
            closed: CancellationToken::new(),
            live: AtomicUsize::new(size),
            next_id: AtomicUsize::new(size),
            options,
        });
        spawn_maintenance(Arc::downgrade(&shared), shared.closed.clone(), shared.options.maintenance_interval);

        tracing::info!(size, "python pool ready");
        Ok(Self { shared })
    }

    /// 在 workdir 下执行代码，返回捕获的输出
    pub async fn execute(&self, code: &str, workdir: &Path) -> Result<String, PoolError> {
        if self.shared.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }
        let line = WorkerRequest::new(code, workdir).to_line()?;
        let mut lease = self.acquire().await?;

        let exec_timeout = self.shared.options.exec_timeout;
        let closed = self.shared.closed.clone();
        let outcome = {
            let worker = lease.worker()?;
            tokio::select! {
                biased;
                _ = closed.cancelled() => Err(PoolError::Closed),
                r = tokio::time::timeout(exec_timeout, worker.round_trip(&line)) => {
                    r.unwrap_or_else(|_| Err(PoolError::ExecutionTimeout(exec_timeout.as_secs())))
                }
            }
        };

        match outcome {
            Ok(response) => {
                if lease.reusable() {
                    lease.release().await;
                } else {
                    tracing::warn!("python worker no longer ready after job, replacing");
                    lease.discard();
                }
                response.into_result()
            }
            Err(PoolError::Closed) => {
                lease.terminate().await;
                Err(PoolError::Closed)
            }
            Err(e) => {
                tracing::warn!(error = %e, "python worker failed, scheduling replacement");
                lease.discard();
                Err(e)
            }
        }
    }

    /// 在获取超时内租用一个健康的空闲 worker；已退出的 worker 会被替换并跳过
    async fn acquire(&self) -> Result<Lease, PoolError> {
        let acquire_timeout = self.shared.options.acquire_timeout;
        let deadline = Instant::now() + acquire_timeout;
        loop {
            let permit = match tokio::time::timeout_at(deadline, self.shared.available.acquire()).await {
                Err(_) => return Err(PoolError::AcquireTimeout(acquire_timeout.as_secs())),
                Ok(Err(_)) => return Err(PoolError::Closed),
                Ok(Ok(permit)) => permit,
            };
            permit.forget();

            let worker = self.shared.idle.lock().await.pop_front();
            let mut worker = match worker {
                Some(w) => w,
                None => continue,
            };
            if worker.has_exited() {
                tracing::warn!(worker_id = worker.id, "idle python worker has exited, replacing");
                worker.mark_not_ready();
                schedule_replacement(&self.shared, Some(worker));
                continue;
            }
            tracing::debug!(worker_id = worker.id, idle_ms = worker.idle_for().as_millis() as u64, "worker leased");
            return Ok(Lease {
                worker: Some(worker),
                shared: Arc::clone(&self.shared),
            });
        }
    }

    /// 关闭：后续调用立即失败，终止所有 worker；重复调用无副作用
    pub async fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        self.shared.closed.cancel();
        self.shared.available.close();

        let drained: Vec<Worker> = {
            let mut idle = self.shared.idle.lock().await;
            idle.drain(..).collect()
        };
        let count = drained.len();
        join_all(drained.into_iter().map(|mut w| {
            w.mark_not_ready();
            w.terminate()
        }))
        .await;
        tracing::info!(terminated = count, "python pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.shared.size,
            idle: self.shared.idle.lock().await.len(),
            live: self.shared.live.load(Ordering::SeqCst),
            closed: self.is_closed(),
        }
    }

    /// 执行一轮维护（通常由后台任务周期调用）
    pub async fn run_maintenance(&self) {
        maintain(&self.shared).await;
    }
}

impl Drop for PythonPool {
    fn drop(&mut self) {
        // 停止维护任务；空闲 worker 随 Shared 释放被 kill_on_drop 终止
        self.shared.closed.cancel();
        self.shared.available.close();
    }
}

fn spawn_maintenance(shared: Weak<Shared>, closed: CancellationToken, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = ticker.tick() => {
                    match shared.upgrade() {
                        Some(shared) => maintain(&shared).await,
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("python pool maintenance stopped");
    });
}

/// 回收已退出的空闲 worker，并补齐替换失败留下的缺口
async fn maintain(shared: &Arc<Shared>) {
    if shared.closed.is_cancelled() {
        return;
    }
    let idle = shared.idle.lock().await.len();
    let mut reaped = 0;
    for _ in 0..idle {
        let mut worker = match shared.try_take().await {
            Some(w) => w,
            None => break,
        };
        if worker.has_exited() {
            reaped += 1;
            worker.mark_not_ready();
            schedule_replacement(shared, Some(worker));
        } else {
            shared.release(worker).await;
        }
    }

    let live = shared.live.load(Ordering::SeqCst);
    for _ in live..shared.size {
        shared.live.fetch_add(1, Ordering::SeqCst);
        schedule_replacement(shared, None);
    }

    tracing::debug!(idle, reaped, live, size = shared.size, "python pool maintenance");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn options(size: usize) -> PoolOptions {
        PoolOptions {
            size,
            acquire_timeout: Duration::from_secs(2),
            exec_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let opts = PoolOptions {
            python_path: "/nonexistent/python-interpreter".into(),
            ..Default::default()
        };
        assert!(matches!(PythonPool::new(opts).await, Err(PoolError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_execute_and_error_status() {
        if !python_available() {
            eprintln!("python3 not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let pool = PythonPool::new(options(1)).await.unwrap();

        let out = pool.execute("print(6 * 7)", dir.path()).await.unwrap();
        assert_eq!(out.trim(), "42");

        match pool.execute("print('before')\nraise ValueError('bad')", dir.path()).await {
            Err(PoolError::Execution { output, error }) => {
                assert!(output.starts_with("before\n"));
                assert!(error.contains("ValueError: bad"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        // 代码错误不影响 worker 复用
        assert_eq!(pool.stats().await.idle, 1);
        assert_eq!(pool.execute("print('again')", dir.path()).await.unwrap().trim(), "again");
        pool.close().await;
    }

    #[tokio::test]
    async fn test_acquire_timeout_when_all_leased() {
        if !python_available() {
            eprintln!("python3 not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PythonPool::new(PoolOptions {
            size: 1,
            acquire_timeout: Duration::from_millis(300),
            exec_timeout: Duration::from_secs(3),
            ..Default::default()
        })
        .await
        .unwrap());

        let busy = {
            let pool = Arc::clone(&pool);
            let path = dir.path().to_path_buf();
            tokio::spawn(async move { pool.execute("import time\ntime.sleep(1)", &path).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = pool.execute("print(1)", dir.path()).await;
        assert!(matches!(second, Err(PoolError::AcquireTimeout(_))));
        assert!(busy.await.unwrap().is_ok());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_fails_fast() {
        if !python_available() {
            eprintln!("python3 not installed, skipping");
            return;
        }
        let pool = PythonPool::new(options(2)).await.unwrap();
        pool.close().await;
        pool.close().await;
        let stats = pool.stats().await;
        assert!(stats.closed);
        assert_eq!(stats.idle, 0);
        assert_eq!(
            pool.execute("print(1)", Path::new(".")).await,
            Err(PoolError::Closed)
        );
    }
}
