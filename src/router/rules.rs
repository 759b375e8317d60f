//! 确定性分流规则：快速路径、关键词启发式与兜底结果
//!
//! 全部是小写查询上的纯函数，不调用模型。

use crate::router::types::{ClassificationResult, Complexity, PlanStep, RequestType};

const TIME_TRIGGERS: &[&str] = &["时间", "日期", "几点", "今天", "现在", "当前时间", "what time", "current time"];
const TIME_BLOCKERS: &[&str] = &["订单", "销售", "数据", "查询", "统计", "分析"];

const GREETING_TRIGGERS: &[&str] = &["你好", "hello", "hi", "帮助", "help"];
const GREETING_BLOCKERS: &[&str] = &["分析", "查询", "数据"];

const ANALYSIS_INDICATORS: &[&str] = &[
    "分析", "统计", "查询", "计算", "对比", "趋势", "分布", "排名", "销售", "订单", "客户", "产品", "收入",
    "利润", "数量", "图", "表",
];
const CONSULTATION_TRIGGERS: &[&str] = &["可以做什么分析", "分析方向", "怎么分析", "能做什么", "建议"];

const WEB_SEARCH_TRIGGERS: &[&str] = &["天气", "新闻", "股价", "汇率", "搜索最新"];
const WEB_SEARCH_BLOCKERS: &[&str] = &["数据", "订单", "分析"];

const EXPORT_TRIGGERS: &[&str] = &["导出", "下载", "export", "download"];
const EXPORT_OBJECTS: &[&str] = &["数据", "表格", "excel", "csv", "data", "table"];

const TIME_SNIPPET: &str = "import datetime\nprint(datetime.datetime.now().strftime(\"%Y年%m月%d日 %H:%M:%S\"))";

/// 包含任一触发词；纯 ASCII 字母的触发词按整词匹配，避免 "hi" 命中 "which"
pub fn contains_any(query: &str, triggers: &[&str]) -> bool {
    triggers.iter().any(|t| {
        if t.chars().all(|c| c.is_ascii_alphabetic()) {
            query
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|word| word == *t)
        } else {
            query.contains(t)
        }
    })
}

/// 无需工具的直接回答（问候、空查询）
pub fn trivial_result(request_type: RequestType) -> ClassificationResult {
    ClassificationResult {
        request_type,
        task_type: request_type.as_str().to_string(),
        complexity: Complexity::Trivial,
        is_quick_path: true,
        output_format: "text".into(),
        estimated_calls: 0,
        confidence: 1.0,
        ..Default::default()
    }
}

/// 快速路径：时间查询与问候
pub fn detect_quick_path(query_lower: &str) -> Option<ClassificationResult> {
    if contains_any(query_lower, TIME_TRIGGERS) && !contains_any(query_lower, TIME_BLOCKERS) {
        return Some(ClassificationResult {
            request_type: RequestType::Calculation,
            task_type: "calculation".into(),
            complexity: Complexity::Simple,
            is_quick_path: true,
            quick_path_code: Some(TIME_SNIPPET.to_string()),
            needs_python: true,
            output_format: "text".into(),
            estimated_calls: 1,
            confidence: 1.0,
            steps: vec![PlanStep::new(1, "python_executor", "获取系统时间")],
            ..Default::default()
        });
    }

    if contains_any(query_lower, GREETING_TRIGGERS) && !contains_any(query_lower, GREETING_BLOCKERS) {
        return Some(trivial_result(RequestType::Consultation));
    }

    None
}

/// 关键词启发式：咨询、联网搜索、数据导出；模糊情况返回 None 交给模型
pub fn classify_by_keywords(query_lower: &str) -> Option<ClassificationResult> {
    let has_analysis = contains_any(query_lower, ANALYSIS_INDICATORS);

    if !has_analysis && contains_any(query_lower, CONSULTATION_TRIGGERS) {
        return Some(ClassificationResult {
            request_type: RequestType::Consultation,
            task_type: "consultation".into(),
            complexity: Complexity::Simple,
            needs_schema: true,
            output_format: "text".into(),
            estimated_calls: 1,
            confidence: 0.9,
            steps: vec![PlanStep::new(1, "get_data_source_context", "获取数据源信息")],
            ..Default::default()
        });
    }

    if contains_any(query_lower, WEB_SEARCH_TRIGGERS) && !contains_any(query_lower, WEB_SEARCH_BLOCKERS) {
        return Some(ClassificationResult {
            request_type: RequestType::WebSearch,
            task_type: "web_search".into(),
            complexity: Complexity::Simple,
            needs_web_search: true,
            output_format: "text".into(),
            estimated_calls: 1,
            confidence: 0.85,
            steps: vec![PlanStep::new(1, "web_search", "搜索信息")],
            ..Default::default()
        });
    }

    if contains_any(query_lower, EXPORT_TRIGGERS) && contains_any(query_lower, EXPORT_OBJECTS) {
        return Some(ClassificationResult {
            request_type: RequestType::DataExport,
            task_type: "data_query".into(),
            complexity: Complexity::Moderate,
            needs_schema: true,
            needs_sql: true,
            needs_data_export: true,
            output_format: "file".into(),
            estimated_calls: 3,
            confidence: 0.9,
            steps: vec![
                PlanStep::new(1, "get_data_source_context", "获取数据结构"),
                PlanStep::new(2, "execute_sql", "查询数据").after(1),
                PlanStep::new(3, "export_data", "导出为Excel").after(2),
            ],
            ..Default::default()
        });
    }

    None
}

/// 保守的兜底结果：数据分析 + 图表，schema → SQL → 生成代码
pub fn fallback_result(query_lower: &str) -> ClassificationResult {
    let mut result = ClassificationResult {
        request_type: RequestType::DataAnalysis,
        needs_visualization: true,
        confidence: 0.5,
        reasoning: "Fallback - defaulting to visualization".into(),
        suggested_chart_type: "bar".into(),
        task_type: "data_query".into(),
        complexity: Complexity::Moderate,
        needs_schema: true,
        needs_sql: true,
        needs_python: true,
        output_format: "chart".into(),
        estimated_calls: 3,
        steps: vec![
            PlanStep::new(1, "get_data_source_context", "获取数据结构"),
            PlanStep::new(2, "execute_sql", "查询数据").after(1),
            PlanStep::new(3, "python_executor", "生成图表").after(2),
        ],
        ..Default::default()
    };

    if contains_any(query_lower, &["建议", "可以做什么"]) && !contains_any(query_lower, &["分析", "统计"]) {
        result.request_type = RequestType::Consultation;
        result.needs_visualization = false;
        result.needs_python = false;
        result.output_format = "text".into();
        result.estimated_calls = 1;
        result.steps.truncate(1);
    }

    if result.needs_visualization {
        if contains_any(query_lower, &["趋势", "变化", "时间", "月", "年"]) {
            result.suggested_chart_type = "line".into();
        } else if contains_any(query_lower, &["占比", "比例", "分布"]) {
            result.suggested_chart_type = "pie".into();
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_quick_path() {
        let result = detect_quick_path("现在几点").unwrap();
        assert!(result.is_quick_path);
        assert_eq!(result.confidence, 1.0);
        assert!(result.quick_code().unwrap().contains("datetime"));
        assert_eq!(result.steps[0].tool, "python_executor");

        assert!(detect_quick_path("what time is it?").is_some());
        // 带数据分析意图不走快速路径
        assert!(detect_quick_path("今天的订单数据").is_none());
    }

    #[test]
    fn test_greeting_uses_whole_words() {
        let greeting = detect_quick_path("hi, 你好").unwrap();
        assert_eq!(greeting.complexity, Complexity::Trivial);
        assert!(greeting.quick_code().is_none());

        assert!(detect_quick_path("which product sold most").is_none());
        assert!(detect_quick_path("你好，帮我分析一下").is_none());
    }

    #[test]
    fn test_keyword_rules() {
        let consult = classify_by_keywords("你能做什么").unwrap();
        assert_eq!(consult.request_type, RequestType::Consultation);
        assert_eq!(consult.confidence, 0.9);

        let search = classify_by_keywords("北京明天天气").unwrap();
        assert_eq!(search.request_type, RequestType::WebSearch);
        assert!(classify_by_keywords("天气对订单的影响").is_none());

        let export = classify_by_keywords("export the data to csv").unwrap();
        assert_eq!(export.request_type, RequestType::DataExport);
        assert_eq!(export.steps.len(), 3);
        assert_eq!(export.steps[2].depends_on, vec![2]);

        assert!(classify_by_keywords("各地区销售额对比").is_none());
    }

    #[test]
    fn test_fallback_variants() {
        let default = fallback_result("哪个品类最好");
        assert_eq!(default.request_type, RequestType::DataAnalysis);
        assert_eq!(default.complexity, Complexity::Moderate);
        assert_eq!(default.steps.len(), 3);
        assert_eq!(default.suggested_chart_type, "bar");

        assert_eq!(fallback_result("每月销售变化").suggested_chart_type, "line");
        assert_eq!(fallback_result("品类占比").suggested_chart_type, "pie");

        let consult = fallback_result("给点建议");
        assert_eq!(consult.request_type, RequestType::Consultation);
        assert_eq!(consult.steps.len(), 1);
        assert!(!consult.needs_visualization);
    }
}
