//! 请求分流：在进入编排循环之前决定请求类型与执行计划
//!
//! 解析顺序（先命中者生效）：
//! 1. 确定性快速路径（时间、问候），不调用模型，不缓存
//! 2. 关键词启发式（咨询、联网搜索、导出），结果写入缓存
//! 3. 缓存查找（TTL 内命中）
//! 4. 单次模型调用；调用失败或输出无法解析时使用兜底结果
//!
//! [`Router::resolve`] 永不返回错误，只会降级。

pub mod cache;
pub mod rules;
pub mod types;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;

use crate::config::RouterConfig;
use crate::llm::ChatModel;
use crate::memory::Message;

pub use cache::ClassificationCache;
pub use types::{ClassificationResult, Complexity, PlanStep, RequestType};

/// 命中的解析层级（用于日志与测试）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    Quick,
    Keyword,
    Cache,
    Model,
    Fallback,
}

const CLASSIFIER_SYSTEM_PROMPT: &str =
    "You are a request classification and task planning expert. Output only valid JSON.";

/// 分流器：规则 + 缓存 + 单次模型调用
pub struct Router {
    model: Option<Arc<dyn ChatModel>>,
    cache: ClassificationCache,
}

impl Router {
    pub fn new(model: Option<Arc<dyn ChatModel>>, ttl: Duration, max_size: usize) -> Self {
        Self {
            model,
            cache: ClassificationCache::new(ttl, max_size),
        }
    }

    pub fn from_config(model: Option<Arc<dyn ChatModel>>, cfg: &RouterConfig) -> Self {
        Self::new(model, Duration::from_secs(cfg.cache_ttl_secs), cfg.cache_max_size)
    }

    pub fn cache(&self) -> &ClassificationCache {
        &self.cache
    }

    pub async fn resolve(&self, query: &str, context: &str) -> ClassificationResult {
        self.resolve_with_tier(query, context).await.0
    }

    pub async fn resolve_with_tier(&self, query: &str, context: &str) -> (ClassificationResult, ResolutionTier) {
        if query.trim().is_empty() {
            return (rules::trivial_result(RequestType::Calculation), ResolutionTier::Quick);
        }

        let query_lower = query.to_lowercase();
        if let Some(result) = rules::detect_quick_path(&query_lower) {
            tracing::info!(tier = "quick", request_type = %result.request_type, "request classified");
            return (result, ResolutionTier::Quick);
        }

        let key = ClassificationCache::key(query, context);
        if let Some(result) = rules::classify_by_keywords(&query_lower) {
            tracing::info!(tier = "keyword", request_type = %result.request_type, "request classified");
            self.cache.insert(key, result.clone()).await;
            return (result, ResolutionTier::Keyword);
        }

        if let Some(result) = self.cache.get(&key).await {
            tracing::info!(tier = "cache", request_type = %result.request_type, "request classified");
            return (result, ResolutionTier::Cache);
        }

        match self.classify_with_model(query, context).await {
            Some(result) => {
                tracing::info!(
                    tier = "model",
                    request_type = %result.request_type,
                    complexity = %result.complexity,
                    steps = result.steps.len(),
                    "request classified"
                );
                self.cache.insert(key, result.clone()).await;
                (result, ResolutionTier::Model)
            }
            None => {
                let result = rules::fallback_result(&query_lower);
                tracing::info!(tier = "fallback", request_type = %result.request_type, "request classified");
                (result, ResolutionTier::Fallback)
            }
        }
    }

    async fn classify_with_model(&self, query: &str, context: &str) -> Option<ClassificationResult> {
        let model = self.model.as_ref()?;
        let messages = vec![
            Message::system(CLASSIFIER_SYSTEM_PROMPT),
            Message::user(build_prompt(query, context)),
        ];

        let response = match model.generate(&messages).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "classification call failed, using fallback");
                return None;
            }
        };

        let json = extract_json(&response.content)?;
        match serde_json::from_str::<ClassificationResult>(json) {
            Ok(mut result) => {
                result.created_at = Utc::now();
                Some(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, "classification output unparsable, using fallback");
                None
            }
        }
    }
}

fn build_prompt(query: &str, context: &str) -> String {
    format!(
        r#"Classify the user request and plan its execution.

## User Request
"{query}"

## Data Source Info
{context}

## Request types
consultation | data_analysis | visualization | data_export | calculation | web_search

## Complexity
trivial (no tools), simple (1 call), moderate (2-3 calls), complex (4+ calls)

## Output JSON
{{
  "request_type": "string",
  "needs_visualization": bool,
  "needs_data_export": bool,
  "confidence": 0.0-1.0,
  "reasoning": "brief reason",
  "suggested_chart_type": "line|bar|pie|grouped_bar|scatter|heatmap",
  "task_type": "simple|data_query|visualization|calculation|web_search",
  "complexity": "trivial|simple|moderate|complex",
  "is_quick_path": bool,
  "needs_schema": bool,
  "needs_sql": bool,
  "needs_python": bool,
  "needs_web_search": bool,
  "output_format": "text|table|chart|file",
  "estimated_calls": 1-8,
  "steps": [{{"step_num":1,"tool":"tool_name","purpose":"purpose","input":"input","depends_on":[]}}]
}}"#
    )
}

static FENCED_JSON: OnceLock<Option<Regex>> = OnceLock::new();

/// 从模型输出中取出 JSON 对象：优先 ``` 代码块，否则取首个 `{` 到最后一个 `}`
pub fn extract_json(content: &str) -> Option<&str> {
    let fenced = FENCED_JSON
        .get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").ok())
        .as_ref()
        .and_then(|re| re.captures(content))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str());
    if fenced.is_some() {
        return fenced;
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}
