//! 推理模型抽象
//!
//! 编排器只依赖 [`ChatModel`]：绑定工具描述、对历史生成下一条 assistant 消息（可能带工具调用）。
//! 具体后端（OpenAI 兼容 / Scripted Mock）各自实现。

use async_trait::async_trait;

use crate::core::AgentError;
use crate::memory::Message;
use crate::tools::ToolDescriptor;

/// 推理模型 trait
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// 绑定可调用的工具；之后的 generate 会把它们提供给模型
    fn bind_tools(&self, tools: &[ToolDescriptor]) -> Result<(), AgentError>;

    /// 基于历史生成下一条消息
    async fn generate(&self, messages: &[Message]) -> Result<Message, AgentError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
