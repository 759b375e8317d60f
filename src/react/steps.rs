//! 编排状态机：MODEL ⇄ TOOLS
//!
//! MODEL 产出带工具调用的消息时进入 TOOLS，否则结束；TOOLS 之后总是回到 MODEL。
//! 两类节点的执行总数受 max_steps 限制，超过即以 [`AgentError::StepLimitExceeded`] 终止。

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, TaskScheduler};
use crate::llm::ChatModel;
use crate::memory::{MemoryManager, Message};
use crate::react::diagnostics::{remediation_message, truncate_output};
use crate::react::events::{
    emit, iteration_progress, send_progress, tool_checkpoint, tool_output_update, ProgressSender, ProgressStage,
};
use crate::react::state::{dedup_user_messages, RunState};
use crate::tools::{ToolContext, ToolExecutor};

/// 下一个节点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Model,
    Tools,
    End,
}

/// 一次运行内所有节点共享的只读依赖
pub struct RunContext<'a> {
    pub model: &'a dyn ChatModel,
    pub executor: &'a ToolExecutor,
    pub scheduler: &'a TaskScheduler,
    /// 为 None 时不做上下文裁剪
    pub memory: Option<&'a dyn MemoryManager>,
    pub cancel: &'a CancellationToken,
    pub progress: Option<&'a ProgressSender>,
    pub max_tool_output_chars: usize,
    /// 本次运行的作业目录等，随每次工具调用传入
    pub tool_context: ToolContext,
}

#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &RunContext<'_>, state: &mut RunState<'_>) -> Result<NextStep, AgentError>;
}

/// 推理节点
pub struct ModelStep;

#[async_trait]
impl Step for ModelStep {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn run(&self, ctx: &RunContext<'_>, state: &mut RunState<'_>) -> Result<NextStep, AgentError> {
        state.iteration += 1;
        state.trajectory.iteration_count = state.iteration;
        let iteration = state.iteration;

        if ctx.cancel.is_cancelled() {
            tracing::info!(iteration, "analysis cancelled");
            return Err(AgentError::Cancelled);
        }

        let before = state.history.len();
        state.history = dedup_user_messages(&state.history);
        let removed = before - state.history.len();
        if removed > 0 {
            tracing::debug!(iteration, removed, "duplicate user messages removed");
        }

        for warning in state.escalation.due(iteration) {
            tracing::info!(iteration, warning = %warning, "escalation injected");
            state.history.push(Message::user(warning));
        }

        emit(ctx.progress, ProgressStage::Analysis, iteration_progress(iteration), "progress.ai_processing", 3);

        let view = match ctx.memory {
            Some(memory) => match memory.reduce(&state.history).await {
                Ok(reduced) => reduced,
                Err(e) => {
                    tracing::warn!(error = %e, "context reduction failed, using full history");
                    state.history.clone()
                }
            },
            None => state.history.clone(),
        };

        match ctx.model.generate(&view).await {
            Ok(response) => {
                state.trajectory.record_model(&view, Some(&response), None);
                let next = if response.has_tool_calls() {
                    NextStep::Tools
                } else {
                    NextStep::End
                };
                tracing::debug!(iteration, tool_calls = response.tool_calls.len(), "model responded");
                state.history.push(response);
                Ok(next)
            }
            Err(e) => {
                tracing::error!(iteration, error = %e, "model call failed");
                state.trajectory.record_model(&view, None, Some(&e));
                Err(e)
            }
        }
    }
}

/// 工具节点：按模型给出的顺序并发执行全部调用，结果按原顺序写回
pub struct ToolsStep;

#[async_trait]
impl Step for ToolsStep {
    fn name(&self) -> &'static str {
        "tools"
    }

    async fn run(&self, ctx: &RunContext<'_>, state: &mut RunState<'_>) -> Result<NextStep, AgentError> {
        if ctx.cancel.is_cancelled() {
            tracing::info!(iteration = state.iteration, "analysis cancelled");
            return Err(AgentError::Cancelled);
        }

        let calls = match state.last_message() {
            Some(m) if m.has_tool_calls() => m.tool_calls.clone(),
            _ => return Err(AgentError::InvalidState("tools step without pending tool calls".into())),
        };

        let mut announced: Vec<&str> = Vec::new();
        for call in &calls {
            if announced.contains(&call.name.as_str()) {
                continue;
            }
            announced.push(&call.name);
            if let Some((stage, progress, key, step)) = tool_checkpoint(&call.name) {
                emit(ctx.progress, stage, progress, key, step);
            }
        }

        // 已开始的工具调用不受取消影响，只受各自的超时约束
        let results = join_all(calls.iter().map(|call| async move {
            let _permit = ctx.scheduler.acquire_tool().await?;
            ctx.executor.execute_in(&call.name, &call.arguments, &ctx.tool_context).await
        }))
        .await;

        for (call, result) in calls.iter().zip(results) {
            let (content, error) = match result {
                Ok(output) => (output, None),
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "tool failed, returning diagnostic");
                    (remediation_message(&call.name, &e), Some(e))
                }
            };
            let content = truncate_output(content, ctx.max_tool_output_chars);
            state.trajectory.record_tool(call, &content, error.as_ref());
            if error.is_none() && !content.is_empty() {
                send_progress(ctx.progress, tool_output_update(&call.name, &content));
            }
            state.history.push(Message::tool(call.id.clone(), content));
        }

        Ok(NextStep::Model)
    }
}

/// 从 MODEL 开始驱动状态机直到结束、出错或超过步数上限
pub async fn drive(ctx: &RunContext<'_>, state: &mut RunState<'_>, max_steps: usize) -> Result<(), AgentError> {
    let model = ModelStep;
    let tools = ToolsStep;
    let mut next = NextStep::Model;
    let mut executed = 0usize;

    loop {
        let step: &dyn Step = match next {
            NextStep::Model => &model,
            NextStep::Tools => &tools,
            NextStep::End => return Ok(()),
        };
        if executed >= max_steps {
            tracing::warn!(max_steps, iteration = state.iteration, "step limit exceeded");
            return Err(AgentError::StepLimitExceeded(max_steps));
        }
        executed += 1;
        tracing::debug!(step = step.name(), executed, "running step");
        next = step.run(ctx, state).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::OrchestratorConfig;
    use crate::llm::ScriptedChatModel;
    use crate::react::state::EscalationSchedule;
    use crate::react::trajectory::Trajectory;
    use crate::tools::{Tool, ToolRegistry};
    use serde_json::Value;

    struct FailingSql;

    #[async_trait]
    impl Tool for FailingSql {
        fn name(&self) -> &str {
            "execute_sql"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Err("no such column: region".into())
        }
    }

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "uppercases text"
        }

        async fn execute(&self, args: Value) -> Result<String, String> {
            Ok(args["text"].as_str().unwrap_or_default().to_uppercase())
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(FailingSql);
        registry.register(Upper);
        ToolExecutor::new(registry, 5)
    }

    #[tokio::test]
    async fn test_tools_results_keep_call_order() {
        let model = ScriptedChatModel::default();
        let executor = executor();
        let scheduler = TaskScheduler::new(2);
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            model: &model,
            executor: &executor,
            scheduler: &scheduler,
            memory: None,
            cancel: &cancel,
            progress: None,
            max_tool_output_chars: 50_000,
            tool_context: ToolContext::default(),
        };

        let mut trajectory = Trajectory::new("t", "q", "db");
        let calls = vec![
            crate::memory::ToolCall::new("c1", "execute_sql", r#"{"query":"SELECT region FROM t"}"#),
            crate::memory::ToolCall::new("c2", "upper", r#"{"text":"ok"}"#),
        ];
        let mut state = RunState::new(
            vec![Message::user("q"), Message::assistant_with_tools("", calls)],
            EscalationSchedule::for_plan(&OrchestratorConfig::default(), 1),
            &mut trajectory,
        );

        let next = ToolsStep.run(&ctx, &mut state).await.unwrap();
        assert_eq!(next, NextStep::Model);
        assert_eq!(state.history[2].tool_call_id.as_deref(), Some("c1"));
        assert!(state.history[2].content.starts_with("❌ SQL Column Error"));
        assert_eq!(state.history[3].content, "OK");
        drop(state);
        assert_eq!(trajectory.tool_call_count, 2);
        assert!(trajectory.steps[0].error.is_some());
    }

    #[tokio::test]
    async fn test_drive_stops_at_step_limit() {
        let model = Arc::new(ScriptedChatModel::default().with_repeat(ScriptedChatModel::tool_call(
            "c",
            "upper",
            r#"{"text":"x"}"#,
        )));
        let executor = executor();
        let scheduler = TaskScheduler::default();
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            model: model.as_ref(),
            executor: &executor,
            scheduler: &scheduler,
            memory: None,
            cancel: &cancel,
            progress: None,
            max_tool_output_chars: 50_000,
            tool_context: ToolContext::default(),
        };
        let mut trajectory = Trajectory::new("t", "q", "db");
        let mut state = RunState::new(vec![Message::user("q")], EscalationSchedule::new(vec![]), &mut trajectory);

        let err = drive(&ctx, &mut state, 5).await.unwrap_err();
        assert_eq!(err, AgentError::StepLimitExceeded(5));
        // MODEL, TOOLS, MODEL, TOOLS, MODEL
        assert_eq!(state.iteration, 3);
        assert_eq!(model.call_count(), 3);
    }
}
