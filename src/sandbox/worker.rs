//! 常驻 worker 进程
//!
//! 一个 worker 同一时刻只属于一个租约持有者（所有权即独占），因此自身不加锁。
//! 超时、传输失败或关闭时被标记为 not ready，随后被终止，不再回到空闲队列。

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::core::PoolError;
use crate::sandbox::protocol::{WorkerResponse, WORKER_SCRIPT};

/// 终止进程后等待回收的上限
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Worker {
    pub id: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    ready: bool,
    last_used: Instant,
}

impl Worker {
    /// 启动解释器并加载常驻脚本
    pub fn spawn(id: usize, python_path: &str) -> Result<Self, PoolError> {
        let mut child = Command::new(python_path)
            .arg("-u")
            .arg("-c")
            .arg(WORKER_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{}: {}", python_path, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("failed to capture worker stdout".into()))?;

        tracing::debug!(worker_id = id, pid = ?child.id(), "python worker spawned");

        Ok(Self {
            id,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            ready: true,
            last_used: Instant::now(),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn mark_not_ready(&mut self) {
        self.ready = false;
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// 进程是否已退出（不阻塞）
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// 发送一行请求并读取一行响应；调用方负责外层超时。
    /// 传输或解析失败后管道状态未知，worker 不再 ready
    pub async fn round_trip(&mut self, request_line: &str) -> Result<WorkerResponse, PoolError> {
        let result = self.exchange(request_line).await;
        if result.is_err() {
            self.ready = false;
        }
        result
    }

    async fn exchange(&mut self, request_line: &str) -> Result<WorkerResponse, PoolError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PoolError::Transport("worker input closed".into()))?;
        stdin
            .write_all(request_line.as_bytes())
            .await
            .map_err(|e| PoolError::Transport(format!("failed to write request: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| PoolError::Transport(format!("failed to flush request: {}", e)))?;

        let mut line = String::new();
        let n = self
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|e| PoolError::Transport(format!("failed to read response: {}", e)))?;
        if n == 0 {
            return Err(PoolError::Transport("worker closed its output".into()));
        }
        WorkerResponse::parse(&line)
    }

    /// 立即发出 kill 信号（同步，不等待退出）
    pub fn start_kill(&mut self) {
        self.ready = false;
        self.stdin = None;
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(worker_id = self.id, error = %e, "kill signal not delivered");
        }
    }

    /// 关闭输入、终止进程并回收
    pub async fn terminate(mut self) {
        self.start_kill();
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(worker_id = self.id, %status, "python worker exited"),
            Ok(Err(e)) => tracing::warn!(worker_id = self.id, error = %e, "failed to reap python worker"),
            Err(_) => tracing::warn!(worker_id = self.id, "python worker did not exit in time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::protocol::WorkerRequest;
    use std::path::Path;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_worker_not_ready_after_broken_pipe() {
        if !python_available() {
            eprintln!("python3 not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut worker = Worker::spawn(0, "python3").unwrap();

        let ok = WorkerRequest::new("print('hi')", dir.path()).to_line().unwrap();
        assert!(worker.round_trip(&ok).await.is_ok());
        assert!(worker.is_ready());

        let exit = WorkerRequest::new("import os\nos._exit(3)", Path::new("")).to_line().unwrap();
        assert!(matches!(worker.round_trip(&exit).await, Err(PoolError::Transport(_))));
        assert!(!worker.is_ready());
        worker.terminate().await;
    }
}
