//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute_in(tool_name, arguments, ctx) 解析模型给出的 JSON 参数后在超时内调用工具，
//! 未知工具、参数错误、超时或失败时转为 AgentError；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::{Tool, ToolContext, ToolDescriptor, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// 不带运行上下文执行
    pub async fn execute(&self, tool_name: &str, arguments: &str) -> Result<String, AgentError> {
        self.execute_in(tool_name, arguments, &ToolContext::default()).await
    }

    /// 执行指定工具；arguments 为模型产出的原始 JSON 文本（空串视为 `{}`）
    pub async fn execute_in(&self, tool_name: &str, arguments: &str, ctx: &ToolContext) -> Result<String, AgentError> {
        let start = Instant::now();
        let preview = args_preview(arguments);

        let result = match self.registry.get(tool_name) {
            None => Err(AgentError::UnknownTool(tool_name.to_string())),
            Some(tool) => match parse_arguments(arguments) {
                Err(e) => Err(e),
                Ok(args) => match timeout(self.timeout, tool.execute_in(args, ctx)).await {
                    Ok(Ok(content)) => Ok(content),
                    Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
                    Err(_) => Err(AgentError::ToolTimeout(format!(
                        "{} exceeded {}s",
                        tool_name,
                        self.timeout.as_secs()
                    ))),
                },
            },
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(AgentError::ToolTimeout(_)) => "timeout",
            Err(AgentError::UnknownTool(_)) => "unknown_tool",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.registry.descriptors()
    }
}

fn parse_arguments(arguments: &str) -> Result<Value, AgentError> {
    if arguments.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(arguments)
        .map_err(|e| AgentError::ToolExecutionFailed(format!("invalid tool arguments: {}", e)))
}

fn args_preview(args: &str) -> String {
    if args.chars().count() > 200 {
        format!("{}...", args.chars().take(200).collect::<String>())
    } else {
        args.to_string()
    }
}
