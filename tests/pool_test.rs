//! 执行池端到端行为（需要 python3，未安装时跳过）

use std::sync::Arc;
use std::time::{Duration, Instant};

use analyst::config::OrchestratorConfig;
use analyst::core::PoolError;
use analyst::llm::{ChatModel, ScriptedChatModel};
use analyst::memory::Message;
use analyst::react::{Orchestrator, RunRequest};
use analyst::router::Router;
use analyst::sandbox::{PoolOptions, PoolStats, PythonPool};
use analyst::tools::{PythonExecutorTool, Tool, ToolRegistry};
use tokio_util::sync::CancellationToken;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn options(size: usize, exec_timeout: Duration) -> PoolOptions {
    PoolOptions {
        size,
        acquire_timeout: Duration::from_secs(10),
        exec_timeout,
        ..Default::default()
    }
}

/// 等待异步替换完成
async fn settled(pool: &PythonPool, within: Duration) -> PoolStats {
    let deadline = Instant::now() + within;
    loop {
        let stats = pool.stats().await;
        if (stats.idle == stats.size && stats.live == stats.size) || Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_stalled_worker_times_out_and_is_replaced() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let pool = PythonPool::new(options(2, Duration::from_secs(5))).await.unwrap();

    assert_eq!(pool.execute("print('one')", dir.path()).await.unwrap().trim(), "one");
    assert_eq!(pool.execute("print('two')", dir.path()).await.unwrap().trim(), "two");

    let started = Instant::now();
    let stalled = pool.execute("import time\ntime.sleep(60)", dir.path()).await;
    assert_eq!(stalled, Err(PoolError::ExecutionTimeout(5)));
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(pool.execute("print(2 + 2)", dir.path()).await.unwrap().trim(), "4");
    assert_eq!(pool.execute("print('five')", dir.path()).await.unwrap().trim(), "five");

    let stats = settled(&pool, Duration::from_secs(10)).await;
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.live, 2);

    pool.close().await;
    assert_eq!(pool.execute("print(1)", dir.path()).await, Err(PoolError::Closed));
}

#[tokio::test]
async fn test_failures_keep_pool_at_full_strength() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let pool = PythonPool::new(options(2, Duration::from_secs(10))).await.unwrap();

    let failed = pool.execute("print('before')\nraise ValueError('bad input')", dir.path()).await;
    match failed {
        Err(PoolError::Execution { output, error }) => {
            assert!(output.contains("before"));
            assert!(error.contains("bad input"));
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // 进程自行退出后由获取或维护逻辑替换
    let _ = pool.execute("import os\nos._exit(3)", dir.path()).await;
    pool.run_maintenance().await;

    for i in 0..4 {
        let out = pool.execute(&format!("print({})", i), dir.path()).await.unwrap();
        assert_eq!(out.trim(), i.to_string());
    }

    let stats = settled(&pool, Duration::from_secs(10)).await;
    assert_eq!((stats.idle, stats.live), (2, 2));
    pool.close().await;
}

#[tokio::test]
async fn test_python_tool_writes_into_workdir() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(PythonPool::new(options(1, Duration::from_secs(10))).await.unwrap());
    let tool = PythonExecutorTool::new(Arc::clone(&pool), dir.path());

    let out = tool
        .execute(serde_json::json!({"code": "open('chart.txt', 'w').write('ok')\nprint('saved')"}))
        .await
        .unwrap();
    assert_eq!(out.trim(), "saved");
    assert!(dir.path().join("chart.txt").exists());

    let err = tool.execute(serde_json::json!({"code": "1 / 0"})).await.unwrap_err();
    assert!(err.contains("ZeroDivisionError"));
    pool.close().await;
}

#[tokio::test]
async fn test_time_question_answered_by_quick_path() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(PythonPool::new(options(1, Duration::from_secs(10))).await.unwrap());
    let model = Arc::new(ScriptedChatModel::default());

    let mut registry = ToolRegistry::new();
    registry.register(PythonExecutorTool::new(Arc::clone(&pool), dir.path()));
    let orchestrator = Orchestrator::new(
        Arc::clone(&model) as Arc<dyn ChatModel>,
        Arc::new(Router::new(None, Duration::from_secs(300), 100)),
        registry,
        OrchestratorConfig::default(),
    )
    .unwrap()
    .with_pool(Arc::clone(&pool));

    let reply = orchestrator
        .run(
            RunRequest::new("t", vec![Message::user("现在几点")]).with_session_dir(dir.path()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(reply.content.contains('年'));
    assert_eq!(model.call_count(), 0);
    pool.close().await;
}

#[tokio::test]
async fn test_python_tool_uses_run_session_dir() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let tool_dir = tempfile::tempdir().unwrap();
    let session_dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(PythonPool::new(options(1, Duration::from_secs(10))).await.unwrap());
    let model = Arc::new(ScriptedChatModel::replies(vec![
        ScriptedChatModel::tool_call(
            "c1",
            "python_executor",
            &serde_json::json!({"code": "open('chart.png', 'w').write('png')\nprint('saved')"}).to_string(),
        ),
        Message::assistant("图表已生成"),
    ]));

    let mut registry = ToolRegistry::new();
    registry.register(PythonExecutorTool::new(Arc::clone(&pool), tool_dir.path()));
    let orchestrator = Orchestrator::new(
        Arc::clone(&model) as Arc<dyn ChatModel>,
        Arc::new(Router::new(None, Duration::from_secs(300), 100)),
        registry,
        OrchestratorConfig::default(),
    )
    .unwrap();

    let reply = orchestrator
        .run(
            RunRequest::new("t", vec![Message::user("画一张销售趋势图")]).with_session_dir(session_dir.path()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(reply.content, "图表已生成");
    assert!(session_dir.path().join("chart.png").exists());
    assert!(!tool_dir.path().join("chart.png").exists());
    pool.close().await;
}
