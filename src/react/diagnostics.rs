//! 工具失败时反馈给模型的诊断消息，以及工具输出截断
//!
//! 诊断会作为该工具调用的结果写回历史，让模型在下一轮自行修正，而不是终止运行。

use crate::core::AgentError;

const SQL_TOOL: &str = "execute_sql";
const PYTHON_TOOL: &str = "python_executor";

/// 错误原文（去掉 AgentError 的前缀）
pub fn error_text(err: &AgentError) -> String {
    match err {
        AgentError::ToolExecutionFailed(s) | AgentError::ToolTimeout(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 按工具与错误类别给出修复指引
pub fn remediation_message(tool: &str, err: &AgentError) -> String {
    let detail = error_text(err);
    match tool {
        SQL_TOOL => sql_remediation(&detail),
        PYTHON_TOOL => format!("❌ Python Error: {}\n\n💡 Please fix the code and retry.", detail),
        _ => format!("❌ Tool Error: {}\n\n💡 Please fix and retry.", detail),
    }
}

fn sql_remediation(detail: &str) -> String {
    let lower = detail.to_lowercase();
    if lower.contains("no such column") || lower.contains("unknown column") {
        format!(
            "❌ SQL Column Error: {}\n\n💡 REQUIRED ACTION:\n\
             1. Call get_data_source_context to see actual column names\n\
             2. If using subquery, ensure ALL columns needed by outer query are in subquery's SELECT\n\
             3. Rewrite and execute the corrected query",
            detail
        )
    } else if lower.contains("syntax error") {
        format!(
            "❌ SQL Syntax Error: {}\n\n💡 SQLite hints:\n\
             - Use strftime('%Y', col) instead of YEAR(col)\n\
             - Use col1 || col2 instead of CONCAT()\n\
             Rewrite and execute the corrected query",
            detail
        )
    } else {
        format!("❌ SQL Error: {}\n\n💡 Please fix and retry.", detail)
    }
}

/// 超过预算的输出保留前 max_chars 个字符，并追加省略说明
pub fn truncate_output(output: String, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output;
    }
    let mut kept: String = output.chars().take(max_chars).collect();
    kept.push_str(&format!(
        "\n\n[... Output truncated - {} chars omitted for context limit]",
        total - max_chars
    ));
    kept
}
