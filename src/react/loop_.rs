//! 编排入口：分流 → 快速路径或 MODEL⇄TOOLS 循环 → 轨迹落盘 → 后台记忆提取
//!
//! 每次运行独占自己的历史与轨迹；取消、步数上限、模型失败和 panic 都会以单一错误返回，
//! 且无论以何种方式退出，轨迹都会被结束并交给 sink。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::core::{AgentError, TaskScheduler};
use crate::llm::ChatModel;
use crate::memory::{last_user_content, AnalysisDigest, MemoryExtractor, MemoryManager, Message, Role, ToolCall};
use crate::react::events::{emit, ProgressSender, ProgressStage};
use crate::react::state::{EscalationSchedule, RunState};
use crate::react::steps::{drive, RunContext};
use crate::react::trajectory::{Trajectory, TrajectorySink};
use crate::router::{ClassificationResult, Router};
use crate::sandbox::PythonPool;
use crate::tools::{ToolContext, ToolExecutor, ToolRegistry, PYTHON_EXECUTOR_TOOL};

const BASE_SYSTEM_PROMPT: &str = "你是一名数据分析助手，可以调用工具查看数据结构、执行 SQL、运行 Python 代码。\n\
规则：\n\
- 先了解数据结构再写查询，列名以 get_data_source_context 的结果为准\n\
- 数据库为 SQLite，使用 SQLite 语法\n\
- 工具返回错误时根据提示修正后重试\n\
- 得到结果后直接给出结论，不要重复调用相同的工具";

/// 一次运行的输入
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub thread_id: String,
    /// 调用方持有的对话历史，最后一条 user 消息即本次请求
    pub history: Vec<Message>,
    /// 数据源描述，用于分流与系统提示
    pub context_descriptor: String,
    /// 作业工作目录与轨迹落盘目录；为 None 时使用配置值
    pub session_dir: Option<PathBuf>,
}

impl RunRequest {
    pub fn new(thread_id: impl Into<String>, history: Vec<Message>) -> Self {
        Self {
            thread_id: thread_id.into(),
            history,
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context_descriptor: impl Into<String>) -> Self {
        self.context_descriptor = context_descriptor.into();
        self
    }

    pub fn with_session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = Some(dir.into());
        self
    }
}

/// 编排器：构造时绑定工具，之后可被多个运行并发共享
pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    router: Arc<Router>,
    executor: ToolExecutor,
    scheduler: Arc<TaskScheduler>,
    pool: Option<Arc<PythonPool>>,
    memory: Option<Arc<dyn MemoryManager>>,
    extractor: Option<Arc<dyn MemoryExtractor>>,
    sink: Option<Arc<dyn TrajectorySink>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// 绑定失败属于配置错误
    pub fn new(
        model: Arc<dyn ChatModel>,
        router: Arc<Router>,
        registry: ToolRegistry,
        config: OrchestratorConfig,
    ) -> Result<Self, AgentError> {
        model.bind_tools(&registry.descriptors()).map_err(|e| match e {
            AgentError::Config(_) => e,
            other => AgentError::Config(format!("failed to bind tools: {}", other)),
        })?;
        tracing::info!(tools = ?registry.tool_names(), "tools bound to model");

        Ok(Self {
            model,
            router,
            executor: ToolExecutor::new(registry, config.tool_timeout_secs),
            scheduler: Arc::new(TaskScheduler::new(config.max_concurrent_tools)),
            pool: None,
            memory: None,
            extractor: None,
            sink: None,
            config,
        })
    }

    /// 快速路径直接在池上执行代码
    pub fn with_pool(mut self, pool: Arc<PythonPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MemoryExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_trajectory_sink(mut self, sink: Arc<dyn TrajectorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.executor.tool_names()
    }

    /// 执行一次分析；返回最终 assistant 消息或唯一的终止错误
    pub async fn run(
        &self,
        request: RunRequest,
        progress: Option<&ProgressSender>,
        cancel: CancellationToken,
    ) -> Result<Message, AgentError> {
        let user_request = last_user_content(&request.history).unwrap_or_default().to_string();
        let session_dir = request
            .session_dir
            .clone()
            .or_else(|| self.config.session_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        let mut trajectory = Trajectory::new(&request.thread_id, &user_request, &request.context_descriptor);
        tracing::info!(thread_id = %request.thread_id, "analysis started");

        let outcome = AssertUnwindSafe(self.run_inner(
            &request,
            &user_request,
            &session_dir,
            progress,
            &cancel,
            &mut trajectory,
        ))
        .catch_unwind()
        .await;

        let (result, history) = match outcome {
            Ok(Ok((message, history))) => (Ok(message), Some(history)),
            Ok(Err(e)) => (Err(e), None),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                tracing::error!(thread_id = %request.thread_id, panic = %msg, "analysis panicked");
                (Err(AgentError::Panicked(msg)), None)
            }
        };

        trajectory.finish(&result);
        match &result {
            Ok(_) => tracing::info!(
                thread_id = %request.thread_id,
                iterations = trajectory.iteration_count,
                tool_calls = trajectory.tool_call_count,
                duration_ms = trajectory.total_duration_ms,
                "analysis completed"
            ),
            Err(e) => tracing::warn!(
                thread_id = %request.thread_id,
                iterations = trajectory.iteration_count,
                error = %e,
                "analysis failed"
            ),
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.save(&session_dir, &trajectory).await {
                tracing::warn!(error = %e, "failed to save trajectory");
            }
        }

        if let (Ok(message), Some(history)) = (&result, history) {
            self.submit_extraction(&request.thread_id, &user_request, &history, &message.content);
        }

        result
    }

    async fn run_inner(
        &self,
        request: &RunRequest,
        user_request: &str,
        session_dir: &Path,
        progress: Option<&ProgressSender>,
        cancel: &CancellationToken,
        trajectory: &mut Trajectory,
    ) -> Result<(Message, Vec<Message>), AgentError> {
        if !request.history.iter().any(|m| m.role == Role::User) {
            return Err(AgentError::EmptyHistory);
        }

        emit(progress, ProgressStage::Initializing, 5, "progress.initializing_tools", 1);
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let plan = self.router.resolve(user_request, &request.context_descriptor).await;

        if let Some(reply) = self.try_quick_path(&plan, session_dir, progress, trajectory).await {
            emit(progress, ProgressStage::Complete, 100, "progress.analysis_complete", 6);
            let mut history = request.history.clone();
            history.push(reply.clone());
            return Ok((reply, history));
        }

        emit(progress, ProgressStage::Initializing, 10, "progress.tools_ready", 1);

        let mut history = Vec::with_capacity(request.history.len() + 1);
        history.push(Message::system(system_prompt(&plan, &request.context_descriptor)));
        history.extend(request.history.iter().cloned());

        emit(progress, ProgressStage::Initializing, 15, "progress.preparing_context", 1);

        let escalation = EscalationSchedule::for_plan(&self.config, plan.estimated_calls);
        tracing::debug!(
            estimated_calls = plan.estimated_calls,
            thresholds = ?escalation.thresholds(),
            "escalation schedule"
        );

        let memory = if self.config.enable_memory {
            self.memory.as_deref()
        } else {
            None
        };
        let ctx = RunContext {
            model: self.model.as_ref(),
            executor: &self.executor,
            scheduler: &self.scheduler,
            memory,
            cancel,
            progress,
            max_tool_output_chars: self.config.max_tool_output_chars,
            tool_context: ToolContext::with_workdir(session_dir),
        };
        let mut state = RunState::new(history, escalation, trajectory);
        drive(&ctx, &mut state, self.config.max_steps).await?;

        let reply = state
            .last_message()
            .filter(|m| m.role == Role::Assistant)
            .cloned()
            .ok_or_else(|| AgentError::InvalidState("run ended without an assistant reply".into()))?;

        emit(progress, ProgressStage::Complete, 100, "progress.analysis_complete", 6);
        Ok((reply, state.history))
    }

    /// 快速路径：直接执行计划附带的代码；失败时返回 None，由完整循环接手
    async fn try_quick_path(
        &self,
        plan: &ClassificationResult,
        session_dir: &Path,
        progress: Option<&ProgressSender>,
        trajectory: &mut Trajectory,
    ) -> Option<Message> {
        let code = plan.quick_code()?;
        let pool = self.pool.as_ref()?;

        emit(progress, ProgressStage::Analysis, 60, "progress.running_python", 5);
        match pool.execute(code, session_dir).await {
            Ok(output) => {
                let call = ToolCall::new(
                    format!("quick_{}", uuid::Uuid::new_v4().simple()),
                    PYTHON_EXECUTOR_TOOL,
                    serde_json::json!({ "code": code }).to_string(),
                );
                trajectory.record_tool(&call, &output, None);
                trajectory.iteration_count = 1;
                tracing::info!("quick path answered directly");
                Some(Message::assistant(output.trim()))
            }
            Err(e) => {
                tracing::warn!(error = %e, "quick path failed, falling back to full analysis");
                None
            }
        }
    }

    fn submit_extraction(&self, thread_id: &str, user_query: &str, history: &[Message], final_response: &str) {
        if !self.config.enable_memory {
            return;
        }
        let Some(extractor) = self.extractor.clone() else {
            return;
        };
        let digest = AnalysisDigest::from_history(thread_id, user_query, history, final_response);
        if digest.is_empty() {
            return;
        }
        self.scheduler.spawn_background("memory_extraction", async move {
            if let Err(e) = extractor.extract(digest).await {
                tracing::warn!(error = %e, "memory extraction failed");
            }
        });
    }
}

fn system_prompt(plan: &ClassificationResult, context: &str) -> String {
    let mut prompt = String::from(BASE_SYSTEM_PROMPT);
    if !context.trim().is_empty() {
        prompt.push_str("\n\n## 数据源\n");
        prompt.push_str(context);
    }
    prompt.push_str(&plan.format_plan_for_prompt());
    prompt
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
