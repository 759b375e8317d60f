//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时并统一转 AgentError。
//! 启动时各工具由 ToolProvider 并行构造，全部完成后才交给编排器（fan-out / fan-in）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// 提供给推理模型的工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema
    pub parameters: Value,
}

/// 单次运行传给工具的上下文
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// 本次运行的作业目录（生成的图表、导出文件写在这里）
    pub workdir: Option<PathBuf>,
}

impl ToolContext {
    pub fn with_workdir(dir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: Some(dir.into()),
        }
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（与模型 tool_calls 中的 name 对应）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    /// 默认返回空对象，表示无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn describe(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }

    /// 执行工具；Err 中的文本会作为诊断反馈给模型
    async fn execute(&self, args: Value) -> Result<String, String>;

    /// 在某次运行的上下文中执行；不关心上下文的工具无需覆盖
    async fn execute_in(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        self.execute(args).await
    }
}

/// 工具构造器：启动时异步构造一个工具（可能需要连接数据源、读取配置等）
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// 用于日志
    fn label(&self) -> &str;

    async fn build(&self) -> Result<Arc<dyn Tool>, AgentError>;
}

/// 已构造好的工具直接作为 provider
pub struct ReadyTool(pub Arc<dyn Tool>);

#[async_trait]
impl ToolProvider for ReadyTool {
    fn label(&self) -> &str {
        self.0.name()
    }

    async fn build(&self) -> Result<Arc<dyn Tool>, AgentError> {
        Ok(Arc::clone(&self.0))
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the latest");
        }
    }

    /// 并行构造所有工具，全部完成后返回；构造失败的工具被跳过并记录
    pub async fn build_parallel(providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        let results = join_all(providers.iter().map(|p| async move {
            let result = p.build().await;
            (p.label().to_string(), result)
        }))
        .await;

        let mut registry = Self::new();
        for (label, result) in results {
            match result {
                Ok(tool) => registry.register_arc(tool),
                Err(e) => tracing::warn!(provider = %label, error = %e, "tool construction failed, skipping"),
            }
        }
        tracing::info!(tools = registry.len(), "tool registry ready");
        registry
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 绑定到推理模型的描述列表（按名称排序，保证每次一致）
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self.tools.values().map(|t| t.describe()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
