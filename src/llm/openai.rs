//! OpenAI 兼容 API 客户端
//!
//! 直接以 reqwest 调用 `{base_url}/chat/completions`（可配置 base_url）；支持 OpenAI、DeepSeek、自建代理等。
//! 绑定的工具以 function tools 形式随每次请求发送，响应中的 tool_calls 转为 [`ToolCall`]。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::ChatModel;
use crate::memory::{Message, ToolCall};
use crate::tools::ToolDescriptor;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Clone, Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Clone, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// OpenAI 兼容客户端：持有 HTTP Client、model 名与已绑定的工具
pub struct OpenAiChatModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    max_tokens: Option<u32>,
    tools: RwLock<Vec<WireTool>>,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiChatModel {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        if model.trim().is_empty() {
            return Err(AgentError::Config("llm.model must not be empty".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.unwrap_or_else(|| "sk-placeholder".to_string()),
            max_tokens: None,
            tools: RwLock::new(Vec::new()),
            usage: TokenUsage::new(),
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn to_wire(message: &Message) -> WireMessage {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: c.id.clone(),
                        r#type: function_type(),
                        function: WireFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        };
        WireMessage {
            role: message.role.as_str().to_string(),
            content: Some(message.content.clone()),
            tool_call_id: message.tool_call_id.clone(),
            tool_calls,
        }
    }

    fn from_wire(message: WireMessage) -> Message {
        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall::new(c.id, c.function.name, c.function.arguments))
            .collect();
        Message::assistant_with_tools(message.content.unwrap_or_default(), tool_calls)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn bind_tools(&self, tools: &[ToolDescriptor]) -> Result<(), AgentError> {
        let wire = tools
            .iter()
            .map(|t| WireTool {
                r#type: "function",
                function: WireFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect();
        let mut bound = self
            .tools
            .write()
            .map_err(|_| AgentError::InvalidState("tool binding lock poisoned".into()))?;
        *bound = wire;
        Ok(())
    }

    async fn generate(&self, messages: &[Message]) -> Result<Message, AgentError> {
        let tools = self
            .tools
            .read()
            .map(|t| t.clone())
            .map_err(|_| AgentError::InvalidState("tool binding lock poisoned".into()))?;
        let body = ChatRequest {
            model: &self.model,
            messages: messages.iter().map(Self::to_wire).collect(),
            max_tokens: self.max_tokens,
            tools,
        };

        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(model = %self.model, messages = messages.len(), "chat completion request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Llm(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(AgentError::Llm(format!("{}: {}", status, message)));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| AgentError::Llm(format!("invalid response: {}", e)))?;

        // 提取 token 使用统计
        if let Some(usage) = &parsed.usage {
            self.usage.add(usage.prompt_tokens, usage.completion_tokens);
        }

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Llm("no choices in response".into()))?;

        Ok(Self::from_wire(choice.message))
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    #[test]
    fn test_empty_model_is_config_error() {
        let err = OpenAiChatModel::new("https://api.openai.com/v1", " ", None, Duration::from_secs(5));
        assert!(matches!(err, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_tool_message_wire_format() {
        let wire = OpenAiChatModel::to_wire(&Message::tool("call_1", "ok"));
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn test_response_tool_calls_are_parsed() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "execute_sql", "arguments": "{\"query\":\"SELECT 1\"}"}}
            ]}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let msg = OpenAiChatModel::from_wire(parsed.choices.into_iter().next().unwrap().message);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "");
        assert_eq!(msg.tool_calls[0].name, "execute_sql");
        assert_eq!(msg.tool_calls[0].arguments, r#"{"query":"SELECT 1"}"#);
    }
}
