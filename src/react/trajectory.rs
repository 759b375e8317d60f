//! 运行轨迹：一次编排运行中推理与工具步骤的完整有序记录，供离线分析与训练
//!
//! 记录内的文本经过 [`escape_for_training`] 转义，换行等控制字符以字面形式保留。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::{Message, ToolCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ModelCall,
    ToolCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub step_number: usize,
    /// 毫秒时间戳
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_input: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrajectoryStep {
    fn new(step_number: usize, kind: StepKind) -> Self {
        Self {
            step_number,
            timestamp: Utc::now().timestamp_millis(),
            kind,
            model_input: Vec::new(),
            model_output: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            tool_call_id: None,
            error: None,
        }
    }
}

/// 一次运行的轨迹
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub thread_id: String,
    pub user_request: String,
    pub data_source_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: i64,
    pub steps: Vec<TrajectoryStep>,
    pub final_response: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub iteration_count: usize,
    pub tool_call_count: usize,
}

impl Trajectory {
    pub fn new(thread_id: &str, user_request: &str, data_source_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            user_request: escape_for_training(user_request),
            data_source_id: data_source_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            total_duration_ms: 0,
            steps: Vec::new(),
            final_response: String::new(),
            success: false,
            error_message: None,
            iteration_count: 0,
            tool_call_count: 0,
        }
    }

    fn next_number(&self) -> usize {
        self.steps.len() + 1
    }

    /// 记录一次推理调用；output 与 error 二选一
    pub fn record_model(&mut self, input: &[Message], output: Option<&Message>, error: Option<&AgentError>) {
        let mut step = TrajectoryStep::new(self.next_number(), StepKind::ModelCall);
        step.model_input = input.iter().map(escaped_message).collect();
        step.model_output = output.map(escaped_message);
        step.error = error.map(|e| escape_for_training(&e.to_string()));
        self.steps.push(step);
    }

    /// 记录一次工具调用
    pub fn record_tool(&mut self, call: &ToolCall, output: &str, error: Option<&AgentError>) {
        let mut step = TrajectoryStep::new(self.next_number(), StepKind::ToolCall);
        step.tool_name = Some(call.name.clone());
        step.tool_input = Some(escape_for_training(&call.arguments));
        step.tool_output = Some(escape_for_training(output));
        step.tool_call_id = Some(call.id.clone());
        step.error = error.map(|e| escape_for_training(&e.to_string()));
        self.steps.push(step);
        self.tool_call_count += 1;
    }

    /// 结束轨迹（任何退出路径都会调用）
    pub fn finish(&mut self, result: &Result<Message, AgentError>) {
        let end = Utc::now();
        self.total_duration_ms = (end - self.start_time).num_milliseconds();
        self.end_time = Some(end);
        match result {
            Ok(msg) => {
                self.success = true;
                self.final_response = escape_for_training(&msg.content);
                self.error_message = None;
            }
            Err(e) => {
                self.success = false;
                self.error_message = Some(e.to_string());
            }
        }
    }
}

/// 把控制字符、引号与反斜杠转成字面转义序列
pub fn escape_for_training(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for c in content.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '"' => out.push_str("\\\""),
            other => out.push(other),
        }
    }
    out
}

fn escaped_message(message: &Message) -> Message {
    let mut m = message.clone();
    m.content = escape_for_training(&m.content);
    for call in &mut m.tool_calls {
        call.arguments = escape_for_training(&call.arguments);
    }
    m
}

/// 轨迹接收方（持久化由外部协作者负责）
#[async_trait]
pub trait TrajectorySink: Send + Sync {
    async fn save(&self, session_dir: &Path, trajectory: &Trajectory) -> anyhow::Result<()>;
}

/// 写入 `<session_dir>/trajectory/<start_ms>.json`
#[derive(Debug, Default, Clone)]
pub struct JsonFileTrajectorySink;

impl JsonFileTrajectorySink {
    pub fn path_for(session_dir: &Path, trajectory: &Trajectory) -> PathBuf {
        session_dir
            .join("trajectory")
            .join(format!("{}.json", trajectory.start_time.timestamp_millis()))
    }
}

#[async_trait]
impl TrajectorySink for JsonFileTrajectorySink {
    async fn save(&self, session_dir: &Path, trajectory: &Trajectory) -> anyhow::Result<()> {
        let path = Self::path_for(session_dir, trajectory);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(trajectory)?;
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), steps = trajectory.steps.len(), "trajectory saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_for_training() {
        assert_eq!(escape_for_training("a\nb\t\"c\"\\"), "a\\nb\\t\\\"c\\\"\\\\");
        assert_eq!(escape_for_training("销售额"), "销售额");
    }

    #[test]
    fn test_record_and_finish() {
        let mut t = Trajectory::new("thread-1", "查询\n订单", "sales.db");
        assert_eq!(t.user_request, "查询\\n订单");

        let call = ToolCall::new("c1", "execute_sql", r#"{"query":"SELECT 1"}"#);
        t.record_model(&[Message::user("q")], Some(&Message::assistant_with_tools("", vec![call.clone()])), None);
        t.record_tool(&call, "[1]", None);
        t.finish(&Err(AgentError::Cancelled));

        assert_eq!(t.steps.len(), 2);
        assert_eq!(t.steps[1].step_number, 2);
        assert_eq!(t.steps[1].tool_input.as_deref(), Some(r#"{\"query\":\"SELECT 1\"}"#));
        assert_eq!(t.tool_call_count, 1);
        assert!(!t.success);
        assert_eq!(t.error_message.as_deref(), Some("Run cancelled"));
        assert!(t.end_time.is_some());
    }

    #[tokio::test]
    async fn test_json_file_sink_writes_under_session_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Trajectory::new("thread-1", "q", "db");
        t.finish(&Ok(Message::assistant("done")));

        JsonFileTrajectorySink.save(dir.path(), &t).await.unwrap();

        let path = JsonFileTrajectorySink::path_for(dir.path(), &t);
        let saved: Trajectory = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert!(saved.success);
        assert_eq!(saved.final_response, "done");
    }
}
