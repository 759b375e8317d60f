//! 错误类型
//!
//! [`AgentError`] 是编排运行对外的唯一终止错误；[`PoolError`] 是沙箱执行池的错误，
//! 经由 python_executor 工具进入编排时会被转成工具诊断，不会终止运行。

use thiserror::Error;

/// 编排运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 构造期致命错误，不会进入循环
    #[error("Config error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Run cancelled")]
    Cancelled,

    /// 超过引擎步数上限（MODEL 与 TOOLS 节点执行总数）
    #[error("Step limit exceeded: {0} steps")]
    StepLimitExceeded(usize),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Memory error: {0}")]
    Memory(String),

    /// 运行内部出现 panic，已被顶层边界捕获
    #[error("Internal error: {0}")]
    Panicked(String),

    #[error("No user message in history")]
    EmptyHistory,
}

impl AgentError {
    /// 是否属于工具层错误（可转成诊断消息喂回模型）
    pub fn is_tool_error(&self) -> bool {
        matches!(
            self,
            AgentError::ToolExecutionFailed(_) | AgentError::ToolTimeout(_) | AgentError::UnknownTool(_)
        )
    }
}

/// 沙箱执行池错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("python pool is closed")]
    Closed,

    #[error("timeout waiting for available python worker after {0}s")]
    AcquireTimeout(u64),

    #[error("python execution timeout after {0}s")]
    ExecutionTimeout(u64),

    /// 管道断开、响应无法解析等
    #[error("worker transport error: {0}")]
    Transport(String),

    #[error("failed to spawn python worker: {0}")]
    Spawn(String),

    /// 代码本身执行失败；output 为已捕获输出加错误文本
    #[error("python execution failed: {error}")]
    Execution { output: String, error: String },

    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl From<PoolError> for AgentError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::ExecutionTimeout(_) | PoolError::AcquireTimeout(_) => {
                AgentError::ToolTimeout(e.to_string())
            }
            PoolError::Execution { output, .. } => AgentError::ToolExecutionFailed(output),
            other => AgentError::ToolExecutionFailed(other.to_string()),
        }
    }
}
