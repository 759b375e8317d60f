//! python_executor：在沙箱执行池中运行 Python 代码
//!
//! 池错误在这里转成文本诊断；编排层会再套上修复提示写回历史。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::core::{AgentError, PoolError};
use crate::sandbox::PythonPool;
use crate::tools::{Tool, ToolContext};

pub const PYTHON_EXECUTOR_TOOL: &str = "python_executor";

/// 工具参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PythonArgs {
    /// 要执行的 Python 代码；用 print 输出结果，图表保存到当前目录
    pub code: String,
}

pub struct PythonExecutorTool {
    pool: Arc<PythonPool>,
    /// 运行未指定作业目录时使用
    default_workdir: PathBuf,
}

impl PythonExecutorTool {
    pub fn new(pool: Arc<PythonPool>, default_workdir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            default_workdir: default_workdir.into(),
        }
    }
}

/// 执行失败保留已捕获输出
fn pool_error_text(e: PoolError) -> String {
    match AgentError::from(e) {
        AgentError::ToolExecutionFailed(s) | AgentError::ToolTimeout(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl Tool for PythonExecutorTool {
    fn name(&self) -> &str {
        PYTHON_EXECUTOR_TOOL
    }

    fn description(&self) -> &str {
        "Execute Python code for data processing and chart generation. pandas, numpy and matplotlib are available. \
         Print results to stdout; save charts as files in the working directory."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(PythonArgs)).unwrap_or_else(|_| {
            serde_json::json!({
                "type": "object",
                "properties": { "code": { "type": "string" } },
                "required": ["code"]
            })
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.execute_in(args, &ToolContext::default()).await
    }

    async fn execute_in(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let args: PythonArgs = serde_json::from_value(args).map_err(|e| format!("invalid arguments: {}", e))?;
        if args.code.trim().is_empty() {
            return Err("code is empty".to_string());
        }
        self.pool
            .execute(&args.code, ctx.workdir().unwrap_or(self.default_workdir.as_path()))
            .await
            .map_err(pool_error_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_requires_code() {
        let schema = serde_json::to_value(schema_for!(PythonArgs)).unwrap();
        assert_eq!(schema["required"][0], "code");
        assert_eq!(schema["properties"]["code"]["type"], "string");
    }

    #[test]
    fn test_pool_error_text_keeps_partial_output() {
        let text = pool_error_text(PoolError::Execution {
            output: "step 1\nZeroDivisionError: division by zero".into(),
            error: "ZeroDivisionError: division by zero".into(),
        });
        assert!(text.starts_with("step 1"));
        assert_eq!(pool_error_text(PoolError::Closed), "python pool is closed");
    }
}
