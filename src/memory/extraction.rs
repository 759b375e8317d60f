//! 运行结束后的记忆提取
//!
//! 成功的运行会产出一份 [`AnalysisDigest`]（问题、最终回答、执行过的 SQL 与其 JSON 结果），
//! 由编排器作为后台任务交给 [`MemoryExtractor`]，不阻塞调用方拿到回复。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::memory::{Message, Role};

/// 产生查询结果的工具名
const SQL_TOOL: &str = "execute_sql";

/// 单次分析的摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDigest {
    pub thread_id: String,
    pub user_query: String,
    pub final_response: String,
    pub sql_queries: Vec<String>,
    /// 能解析为 JSON 的查询结果
    pub results: Vec<Value>,
}

impl AnalysisDigest {
    /// 从一次运行的完整历史构建摘要
    pub fn from_history(
        thread_id: impl Into<String>,
        user_query: impl Into<String>,
        history: &[Message],
        final_response: impl Into<String>,
    ) -> Self {
        let mut sql_call_ids = Vec::new();
        let mut sql_queries = Vec::new();

        for msg in history.iter().filter(|m| m.role == Role::Assistant) {
            for call in msg.tool_calls.iter().filter(|c| c.name == SQL_TOOL) {
                let query = serde_json::from_str::<Value>(&call.arguments)
                    .ok()
                    .and_then(|v| v.get("query").and_then(Value::as_str).map(str::to_string));
                if let Some(q) = query {
                    sql_queries.push(q);
                    sql_call_ids.push(call.id.clone());
                }
            }
        }

        let results = history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter(|m| {
                m.tool_call_id
                    .as_ref()
                    .map(|id| sql_call_ids.contains(id))
                    .unwrap_or(false)
            })
            .filter_map(|m| serde_json::from_str::<Value>(&m.content).ok())
            .filter(|v| v.is_array() || v.is_object())
            .collect();

        Self {
            thread_id: thread_id.into(),
            user_query: user_query.into(),
            final_response: final_response.into(),
            sql_queries,
            results,
        }
    }

    /// 没有可学习的查询内容
    pub fn is_empty(&self) -> bool {
        self.sql_queries.is_empty()
    }
}

/// 记忆提取协作者（偏好学习等），在后台执行
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    async fn extract(&self, digest: AnalysisDigest) -> Result<(), AgentError>;
}
