//! 分流结果：请求分类 + 执行计划

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Consultation,
    DataAnalysis,
    Visualization,
    DataExport,
    Calculation,
    WebSearch,
    /// 模型给出的未知类型，按数据分析处理
    #[serde(other)]
    Unknown,
}

impl Default for RequestType {
    fn default() -> Self {
        RequestType::DataAnalysis
    }
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Consultation => "consultation",
            RequestType::DataAnalysis => "data_analysis",
            RequestType::Visualization => "visualization",
            RequestType::DataExport => "data_export",
            RequestType::Calculation => "calculation",
            RequestType::WebSearch => "web_search",
            RequestType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 复杂度：trivial（无工具）/ simple（1 次）/ moderate（2-3 次）/ complex（4 次以上）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    #[serde(other)]
    Unknown,
}

impl Default for Complexity {
    fn default() -> Self {
        Complexity::Moderate
    }
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Trivial => "trivial",
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
            Complexity::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 计划中的一步
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanStep {
    pub step_num: u32,
    pub tool: String,
    pub purpose: String,
    pub input: String,
    pub depends_on: Vec<u32>,
}

impl PlanStep {
    pub fn new(step_num: u32, tool: &str, purpose: &str) -> Self {
        Self {
            step_num,
            tool: tool.to_string(),
            purpose: purpose.to_string(),
            ..Default::default()
        }
    }

    pub fn after(mut self, step: u32) -> Self {
        self.depends_on.push(step);
        self
    }
}

/// 分类 + 计划结果；产出后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationResult {
    pub request_type: RequestType,
    pub needs_visualization: bool,
    pub needs_data_export: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub suggested_chart_type: String,

    pub task_type: String,
    pub complexity: Complexity,
    pub is_quick_path: bool,
    /// 快速路径直接执行的代码片段
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_path_code: Option<String>,
    pub needs_schema: bool,
    pub needs_sql: bool,
    pub needs_python: bool,
    pub needs_web_search: bool,
    pub output_format: String,
    pub estimated_calls: u32,
    pub steps: Vec<PlanStep>,

    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

impl Default for ClassificationResult {
    fn default() -> Self {
        Self {
            request_type: RequestType::default(),
            needs_visualization: false,
            needs_data_export: false,
            confidence: 0.0,
            reasoning: String::new(),
            suggested_chart_type: String::new(),
            task_type: String::new(),
            complexity: Complexity::default(),
            is_quick_path: false,
            quick_path_code: None,
            needs_schema: false,
            needs_sql: false,
            needs_python: false,
            needs_web_search: false,
            output_format: "text".to_string(),
            estimated_calls: 0,
            steps: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

impl ClassificationResult {
    /// 是否带有可直接执行的快速路径代码
    pub fn quick_code(&self) -> Option<&str> {
        if !self.is_quick_path {
            return None;
        }
        self.quick_path_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// 写入 system prompt 的计划段落
    pub fn format_plan_for_prompt(&self) -> String {
        let mut out = String::from("\n\n📋 执行计划:\n");
        out.push_str(&format!(
            "类型: {} | 复杂度: {} | 预计调用: {}次\n",
            self.request_type, self.complexity, self.estimated_calls
        ));

        if let Some(code) = self.quick_code() {
            out.push_str("⚡ 快速路径: 直接执行以下代码\n```python\n");
            out.push_str(code);
            out.push_str("\n```\n");
            return out;
        }

        for step in &self.steps {
            out.push_str(&format!("  {}. [{}] {}\n", step.step_num, step.tool, step.purpose));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_model_output() {
        let raw = r#"{"request_type":"forecast","complexity":"extreme","estimated_calls":4,
            "steps":[{"step_num":1,"tool":"execute_sql","purpose":"查询"}]}"#;
        let result: ClassificationResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.request_type, RequestType::Unknown);
        assert_eq!(result.complexity, Complexity::Unknown);
        assert_eq!(result.steps[0].depends_on, Vec::<u32>::new());
        assert!(!result.is_quick_path);
    }

    #[test]
    fn test_format_plan_lists_steps() {
        let result = ClassificationResult {
            request_type: RequestType::DataExport,
            complexity: Complexity::Moderate,
            estimated_calls: 2,
            steps: vec![
                PlanStep::new(1, "execute_sql", "查询数据"),
                PlanStep::new(2, "export_data", "导出为Excel").after(1),
            ],
            ..Default::default()
        };
        let plan = result.format_plan_for_prompt();
        assert!(plan.contains("类型: data_export | 复杂度: moderate | 预计调用: 2次"));
        assert!(plan.contains("  2. [export_data] 导出为Excel\n"));
    }

    #[test]
    fn test_quick_code_requires_flag_and_content() {
        let mut result = ClassificationResult {
            quick_path_code: Some("print(1)".into()),
            ..Default::default()
        };
        assert!(result.quick_code().is_none());
        result.is_quick_path = true;
        assert_eq!(result.quick_code(), Some("print(1)"));
        assert!(result.format_plan_for_prompt().contains("```python\nprint(1)\n```"));
        result.quick_path_code = Some("  ".into());
        assert!(result.quick_code().is_none());
    }
}
