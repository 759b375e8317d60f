//! Token 预算控制
//!
//! 每次推理调用前由编排器调用 [`MemoryManager::reduce`]，把历史压到模型上下文预算以内。
//! 默认实现 [`TokenBudgetMemory`]：先截断较早的工具输出，仍超预算再按短期窗口裁剪。

use async_trait::async_trait;

use crate::core::AgentError;
use crate::memory::{Message, Role};

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 单条消息：正文 + 工具调用参数 + 固定开销
    pub fn estimate_message(message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| Self::estimate(&c.arguments) + Self::estimate(&c.name))
            .sum();
        Self::estimate(&message.content) + calls + MESSAGE_OVERHEAD_TOKENS
    }
}

/// 每条消息的角色/分隔符开销
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// 较早工具输出的逐级截断长度（字符）
const OLD_TOOL_OUTPUT_LIMITS: [usize; 2] = [10_000, 5_000];

/// 记忆管理协作者：按预算压缩历史
#[async_trait]
pub trait MemoryManager: Send + Sync {
    /// 返回压缩后的历史；失败时编排器继续使用原历史
    async fn reduce(&self, history: &[Message]) -> Result<Vec<Message>, AgentError>;

    /// 估算历史占用的 token 数
    fn estimate_size(&self, history: &[Message]) -> usize;
}

/// 基于 token 预算的默认记忆管理
#[derive(Debug, Clone)]
pub struct TokenBudgetMemory {
    max_tokens: usize,
    reserve_percent: usize,
    short_term_messages: usize,
}

impl TokenBudgetMemory {
    pub fn new(max_tokens: usize, short_term_messages: usize) -> Self {
        Self {
            max_tokens,
            reserve_percent: 20,
            short_term_messages: short_term_messages.max(1),
        }
    }

    pub fn with_reserve_percent(mut self, percent: usize) -> Self {
        self.reserve_percent = percent.min(90);
        self
    }

    /// 扣除安全余量后的可用预算
    pub fn target_tokens(&self) -> usize {
        self.max_tokens * (100 - self.reserve_percent) / 100
    }

    /// 截断短期窗口之外的工具输出
    fn truncate_old_tool_outputs(&self, history: &[Message], limit: usize) -> Vec<Message> {
        let window_start = history.len().saturating_sub(self.short_term_messages);
        history
            .iter()
            .enumerate()
            .map(|(idx, msg)| {
                if idx >= window_start || msg.role != Role::Tool {
                    return msg.clone();
                }
                let mut msg = msg.clone();
                if let Some(truncated) = truncate_chars(&msg.content, limit) {
                    msg.content = truncated;
                }
                msg
            })
            .collect()
    }

    /// 保留全部 system 消息与最近的短期窗口；切分点不落在 tool 消息上
    fn keep_recent(&self, history: &[Message]) -> Vec<Message> {
        let (system, conversation): (Vec<&Message>, Vec<&Message>) =
            history.iter().partition(|m| m.role == Role::System);

        if conversation.len() <= self.short_term_messages {
            return history.to_vec();
        }

        let mut start = conversation.len() - self.short_term_messages;
        // tool 结果必须与发起调用的 assistant 消息一起保留
        while start > 0 && conversation[start].role == Role::Tool {
            start -= 1;
        }

        let mut out: Vec<Message> = system.into_iter().cloned().collect();
        if start > 0 {
            out.push(Message::system(format!(
                "[为适应上下文长度，已省略较早的 {} 条消息]",
                start
            )));
        }
        out.extend(conversation[start..].iter().map(|m| (*m).clone()));
        out
    }
}

#[async_trait]
impl MemoryManager for TokenBudgetMemory {
    async fn reduce(&self, history: &[Message]) -> Result<Vec<Message>, AgentError> {
        let target = self.target_tokens();
        if self.estimate_size(history) <= target {
            return Ok(history.to_vec());
        }

        let mut reduced = history.to_vec();
        for limit in OLD_TOOL_OUTPUT_LIMITS {
            reduced = self.truncate_old_tool_outputs(&reduced, limit);
            if self.estimate_size(&reduced) <= target {
                tracing::debug!(limit, "memory reduced by truncating old tool outputs");
                return Ok(reduced);
            }
        }

        let kept = self.keep_recent(&reduced);
        tracing::debug!(
            before = history.len(),
            after = kept.len(),
            tokens = self.estimate_size(&kept),
            target,
            "memory reduced to short-term window"
        );
        Ok(kept)
    }

    fn estimate_size(&self, history: &[Message]) -> usize {
        history.iter().map(TokenEstimator::estimate_message).sum()
    }
}

/// 按字符截断并附上省略标记；未超长返回 None
fn truncate_chars(content: &str, limit: usize) -> Option<String> {
    let total = content.chars().count();
    if total <= limit {
        return None;
    }
    let kept: String = content.chars().take(limit).collect();
    Some(format!(
        "{}\n\n[... Tool output truncated - {} chars omitted]",
        kept,
        total - limit
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn test_token_estimator_chinese() {
        let text = "你好世界，这是一个测试。";
        let tokens = TokenEstimator::estimate(text);
        assert_eq!(tokens, 8);
    }

    #[tokio::test]
    async fn test_reduce_within_budget_is_unchanged() {
        let memory = TokenBudgetMemory::new(10_000, 5);
        let history = vec![Message::system("sys"), Message::user("你好")];
        let reduced = memory.reduce(&history).await.unwrap();
        assert_eq!(reduced, history);
    }

    #[tokio::test]
    async fn test_reduce_truncates_old_tool_output_first() {
        let memory = TokenBudgetMemory::new(5_000, 2);
        let history = vec![
            Message::user("查询订单"),
            Message::assistant_with_tools("", vec![ToolCall::new("c1", "execute_sql", "{}")]),
            Message::tool("c1", "x".repeat(40_000)),
            Message::assistant("好的"),
            Message::user("继续"),
        ];
        let reduced = memory.reduce(&history).await.unwrap();
        assert_eq!(reduced.len(), history.len());
        assert!(reduced[2].content.contains("chars omitted"));
        assert!(reduced[2].content.chars().count() < 11_000);
        assert_eq!(reduced[4].content, "继续");
    }

    #[tokio::test]
    async fn test_reduce_keeps_tool_results_with_their_call() {
        let memory = TokenBudgetMemory::new(1_000, 3);
        let history = vec![
            Message::system("sys"),
            Message::user("y".repeat(10_000)),
            Message::assistant_with_tools(
                "",
                vec![
                    ToolCall::new("c1", "execute_sql", "{}"),
                    ToolCall::new("c2", "execute_sql", "{}"),
                ],
            ),
            Message::tool("c1", "r1"),
            Message::tool("c2", "r2"),
            Message::assistant("完成"),
        ];
        let reduced = memory.reduce(&history).await.unwrap();

        assert_eq!(reduced[0].content, "sys");
        assert_eq!(reduced[1].role, Role::System);
        assert!(reduced[1].content.contains("1 条"));
        assert!(reduced[2].has_tool_calls());
        assert_eq!(reduced[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(reduced.last().unwrap().content, "完成");
        assert!(memory.estimate_size(&reduced) <= memory.target_tokens());
    }

    #[test]
    fn test_truncate_chars_is_utf8_safe() {
        assert!(truncate_chars("短", 10).is_none());
        let out = truncate_chars("数据分析结果", 2).unwrap();
        assert!(out.starts_with("数据"));
        assert!(out.contains("4 chars omitted"));
    }
}
