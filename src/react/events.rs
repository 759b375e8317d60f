//! 编排过程进度事件：用于前端展示当前阶段、百分比与工具输出预览
//!
//! 发送是尽力而为的：没有接收方或接收方已关闭时直接丢弃，不会阻塞运行。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 进度阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Initializing,
    Schema,
    Query,
    Analysis,
    Visualization,
    Export,
    /// 工具输出预览
    ToolOutput,
    Complete,
}

/// 单条进度（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub stage: ProgressStage,
    /// 0-100
    pub progress: u8,
    /// 前端 i18n 键，如 progress.executing_sql
    pub message: String,
    pub step: u8,
    pub total: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
}

impl ProgressUpdate {
    pub fn new(stage: ProgressStage, progress: u8, message: &str, step: u8, total: u8) -> Self {
        Self {
            stage,
            progress: progress.min(100),
            message: message.to_string(),
            step,
            total,
            tool_name: None,
            tool_output: None,
        }
    }
}

pub type ProgressSender = UnboundedSender<ProgressUpdate>;

/// 编排过程总步数（前端进度条分段）
pub const TOTAL_STAGES: u8 = 6;

/// 工具输出预览的最大字符数
pub const TOOL_OUTPUT_PREVIEW_CHARS: usize = 200;

pub(crate) fn send_progress(tx: Option<&ProgressSender>, update: ProgressUpdate) {
    if let Some(t) = tx {
        let _ = t.send(update);
    }
}

pub(crate) fn emit(tx: Option<&ProgressSender>, stage: ProgressStage, progress: u8, message: &str, step: u8) {
    send_progress(tx, ProgressUpdate::new(stage, progress, message, step, TOTAL_STAGES));
}

/// 第 n 轮推理的进度：20% 起，每轮 +10%，最多到 80%
pub fn iteration_progress(iteration: usize) -> u8 {
    (20 + (iteration * 10).min(60)) as u8
}

/// 按工具名给出的进度检查点
pub fn tool_checkpoint(tool: &str) -> Option<(ProgressStage, u8, &'static str, u8)> {
    match tool {
        "get_data_source_context" => Some((ProgressStage::Schema, 25, "progress.loading_schema", 2)),
        "execute_sql" => Some((ProgressStage::Query, 40, "progress.executing_sql", 4)),
        "python_executor" => Some((ProgressStage::Analysis, 60, "progress.running_python", 5)),
        "export_data" => Some((ProgressStage::Export, 70, "progress.exporting_data", 5)),
        _ => None,
    }
}

/// 工具输出预览事件
pub fn tool_output_update(tool: &str, output: &str) -> ProgressUpdate {
    let mut preview: String = output.chars().take(TOOL_OUTPUT_PREVIEW_CHARS).collect();
    if output.chars().count() > TOOL_OUTPUT_PREVIEW_CHARS {
        preview.push_str("...");
    }
    let mut update = ProgressUpdate::new(ProgressStage::ToolOutput, 65, "progress.tool_completed", 4, TOTAL_STAGES);
    update.tool_name = Some(tool.to_string());
    update.tool_output = Some(preview);
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_progress_is_capped() {
        assert_eq!(iteration_progress(1), 30);
        assert_eq!(iteration_progress(6), 80);
        assert_eq!(iteration_progress(15), 80);
    }

    #[test]
    fn test_tool_output_preview() {
        let update = tool_output_update("execute_sql", &"数".repeat(300));
        let preview = update.tool_output.unwrap();
        assert_eq!(preview.chars().count(), TOOL_OUTPUT_PREVIEW_CHARS + 3);
        assert_eq!(update.stage, ProgressStage::ToolOutput);

        let json = serde_json::to_value(ProgressUpdate::new(ProgressStage::Complete, 100, "progress.analysis_complete", 6, 6)).unwrap();
        assert_eq!(json["stage"], "complete");
        assert!(json.get("tool_name").is_none());
    }
}
