//! Analyst - 数据分析助手任务编排器
//!
//! 入口：加载配置、初始化日志、装配运行时，然后逐行读取 stdin 中的请求并输出最终回复。
//! 输入结束或收到关闭信号时，先等正在进行的运行退出，再关闭执行池。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use analyst::config::load_config;
use analyst::core::{PoolCleanup, ShutdownCoordinator, ShutdownManager};
use analyst::memory::Message;
use analyst::react::ProgressUpdate;
use analyst::{build_runtime, observability, Orchestrator, RunRequest};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    let runtime = build_runtime(&cfg).await.context("Failed to build runtime")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    // 已开始的工具调用不会被打断，宽限期按工具超时给
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown))
        .with_drain_timeout(Duration::from_secs(cfg.orchestrator.tool_timeout_secs + 5));
    coordinator.register(PoolCleanup::new(Arc::clone(&runtime.pool)));

    coordinator
        .run(read_requests(Arc::clone(&runtime.orchestrator), shutdown.token()))
        .await;

    Ok(())
}

/// 每行一个请求；同一进程内的请求共享一段对话历史
async fn read_requests(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let thread_id = uuid::Uuid::new_v4().to_string();
    let mut history: Vec<Message> = Vec::new();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        history.push(Message::user(line));

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let progress = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                tracing::debug!(stage = ?update.stage, progress = update.progress, message = %update.message, "progress");
            }
        });

        let request = RunRequest::new(thread_id.clone(), history.clone());
        match orchestrator.run(request, Some(&tx), cancel.child_token()).await {
            Ok(reply) => {
                println!("{}", reply.content);
                history.push(reply);
            }
            Err(e) => {
                eprintln!("error: {}", e);
                history.pop();
            }
        }

        drop(tx);
        let _ = progress.await;
    }
}
