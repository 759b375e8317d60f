//! 运行时装配
//!
//! 从 [`AppConfig`] 构建一个可直接使用的 [`Orchestrator`]：启动执行池、并行构造工具并绑定到模型、
//! 接上分流器、上下文预算与轨迹落盘。数据源相关工具（schema、SQL、导出）由调用方以 provider 形式传入。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::{ChatModel, OpenAiChatModel};
use crate::memory::TokenBudgetMemory;
use crate::react::{JsonFileTrajectorySink, Orchestrator};
use crate::router::Router;
use crate::sandbox::{PoolOptions, PythonPool};
use crate::tools::{LocationService, LocationTool, PythonExecutorTool, ReadyTool, ToolProvider, ToolRegistry};

/// 装配好的运行时；pool 需要在退出时关闭
pub struct AnalystRuntime {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: Arc<PythonPool>,
    pub location: Arc<LocationService>,
}

fn openai_model(cfg: &AppConfig) -> Result<OpenAiChatModel, AgentError> {
    Ok(OpenAiChatModel::new(
        &cfg.llm.base_url,
        &cfg.llm.model,
        cfg.llm.api_key(),
        Duration::from_secs(cfg.llm.request_timeout_secs),
    )?
    .with_max_tokens(cfg.llm.max_tokens))
}

/// 使用 OpenAI 兼容端点构建运行时；分流使用一个不绑定工具的独立客户端
pub async fn build_runtime(cfg: &AppConfig) -> Result<AnalystRuntime, AgentError> {
    cfg.validate()?;
    let model: Arc<dyn ChatModel> = Arc::new(openai_model(cfg)?);
    let classifier: Arc<dyn ChatModel> = Arc::new(openai_model(cfg)?);
    build_runtime_with(cfg, model, Some(classifier), Vec::new()).await
}

/// 注入模型与额外工具构建运行时
pub async fn build_runtime_with(
    cfg: &AppConfig,
    model: Arc<dyn ChatModel>,
    classifier: Option<Arc<dyn ChatModel>>,
    extra_providers: Vec<Arc<dyn ToolProvider>>,
) -> Result<AnalystRuntime, AgentError> {
    let session_dir = cfg
        .orchestrator
        .session_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    let pool = PythonPool::new(PoolOptions::from(&cfg.pool))
        .await
        .map_err(|e| AgentError::Config(format!("failed to start python pool: {}", e)))?;
    let pool = Arc::new(pool);
    let location = Arc::new(LocationService::new(cfg.location.clone()));

    let mut providers: Vec<Arc<dyn ToolProvider>> = vec![
        Arc::new(ReadyTool(Arc::new(PythonExecutorTool::new(Arc::clone(&pool), session_dir)))),
        Arc::new(ReadyTool(Arc::new(LocationTool::new(Arc::clone(&location))))),
    ];
    providers.extend(extra_providers);
    let registry = ToolRegistry::build_parallel(providers).await;

    let router = Arc::new(Router::from_config(classifier, &cfg.router));
    let memory = Arc::new(TokenBudgetMemory::new(
        cfg.memory.max_context_tokens,
        cfg.memory.short_term_messages,
    ));

    let orchestrator = Orchestrator::new(model, router, registry, cfg.orchestrator.clone())?
        .with_pool(Arc::clone(&pool))
        .with_memory(memory)
        .with_trajectory_sink(Arc::new(JsonFileTrajectorySink));

    tracing::info!(
        model = %cfg.llm.model,
        pool_size = pool.size(),
        tools = ?orchestrator.tool_names(),
        "runtime ready"
    );

    Ok(AnalystRuntime {
        orchestrator: Arc::new(orchestrator),
        pool,
        location,
    })
}
