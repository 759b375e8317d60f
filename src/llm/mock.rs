//! Scripted 推理模型（用于测试，无需 API）
//!
//! 按顺序回放预设的回复；脚本耗尽后回放 repeat 消息（若设置），否则返回 LLM 错误。
//! 同时记录每次调用收到的历史，便于断言去重、升级提示等行为。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::ChatModel;
use crate::memory::{Message, ToolCall};
use crate::tools::ToolDescriptor;

/// 一条脚本动作
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(Message),
    Fail(String),
    Panic(String),
}

/// 脚本化模型
#[derive(Debug, Default)]
pub struct ScriptedChatModel {
    script: Mutex<VecDeque<Scripted>>,
    repeat: Option<Message>,
    fail_bind: bool,
    calls: AtomicUsize,
    bound: Mutex<Vec<String>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedChatModel {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    /// 只含回复的脚本
    pub fn replies(messages: Vec<Message>) -> Self {
        Self::new(messages.into_iter().map(Scripted::Reply).collect())
    }

    /// 脚本耗尽后一直返回该消息
    pub fn with_repeat(mut self, message: Message) -> Self {
        self.repeat = Some(message);
        self
    }

    /// bind_tools 返回配置错误
    pub fn with_failing_bind(mut self) -> Self {
        self.fail_bind = true;
        self
    }

    /// 一条请求单个工具调用的 assistant 消息
    pub fn tool_call(id: &str, tool: &str, arguments: &str) -> Message {
        Message::assistant_with_tools("", vec![ToolCall::new(id, tool, arguments)])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn bound_tools(&self) -> Vec<String> {
        self.bound.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// 第 n 次调用（从 0 开始）收到的历史
    pub fn seen(&self, call: usize) -> Option<Vec<Message>> {
        self.seen.lock().ok().and_then(|s| s.get(call).cloned())
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    fn bind_tools(&self, tools: &[ToolDescriptor]) -> Result<(), AgentError> {
        if self.fail_bind {
            return Err(AgentError::Config("scripted model rejects tools".into()));
        }
        if let Ok(mut bound) = self.bound.lock() {
            *bound = tools.iter().map(|t| t.name.clone()).collect();
        }
        Ok(())
    }

    async fn generate(&self, messages: &[Message]) -> Result<Message, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Scripted::Reply(msg)) => Ok(msg),
            Some(Scripted::Fail(e)) => Err(AgentError::Llm(e)),
            Some(Scripted::Panic(e)) => panic!("{}", e),
            None => self
                .repeat
                .clone()
                .ok_or_else(|| AgentError::Llm("script exhausted".into())),
        }
    }
}
