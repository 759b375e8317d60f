//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ANALYST__*` 覆盖（双下划线表示嵌套，如 `ANALYST__POOL__SIZE=4`）。
//! 所有段都有默认值，空配置也能通过反序列化；`llm.model` 必须在 [`AppConfig::validate`] 之前设置。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::AgentError;
use crate::tools::ConfiguredLocation;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub pool: PoolConfig,
    pub router: RouterConfig,
    pub orchestrator: OrchestratorConfig,
    pub memory: MemoryConfig,
    /// 设备位置不可用时的兜底位置
    pub location: Option<ConfiguredLocation>,
}

impl AppConfig {
    /// 构造期校验；失败属于配置错误，不会进入编排循环
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.llm.model.trim().is_empty() {
            return Err(AgentError::Config("llm.model is required".into()));
        }
        if self.orchestrator.max_steps == 0 {
            return Err(AgentError::Config("orchestrator.max_steps must be positive".into()));
        }
        for (name, thresholds) in [
            ("warning_thresholds", &self.orchestrator.warning_thresholds),
            ("extended_warning_thresholds", &self.orchestrator.extended_warning_thresholds),
        ] {
            if thresholds.windows(2).any(|w| w[0] >= w[1]) {
                return Err(AgentError::Config(format!(
                    "orchestrator.{} must be strictly increasing",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 存放 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_tokens: None,
        }
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// [pool] 段：Python 执行池
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_python_path")]
    pub python_path: String,
    /// worker 数量，0 视为 2
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            python_path: default_python_path(),
            size: default_pool_size(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            exec_timeout_secs: default_exec_timeout_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

fn default_python_path() -> String {
    "python3".to_string()
}

fn default_pool_size() -> usize {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_exec_timeout_secs() -> u64 {
    120
}

fn default_maintenance_interval_secs() -> u64 {
    300
}

/// [router] 段：分流缓存
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_size: default_cache_max_size(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_size() -> usize {
    100
}

/// [orchestrator] 段：循环上限、升级提示阈值、工具输出预算
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// MODEL 与 TOOLS 节点执行总数上限
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_warning_thresholds")]
    pub warning_thresholds: Vec<usize>,
    /// 预计调用次数较多时使用的阈值
    #[serde(default = "default_extended_warning_thresholds")]
    pub extended_warning_thresholds: Vec<usize>,
    #[serde(default = "default_extended_threshold_min_calls")]
    pub extended_threshold_min_calls: u32,
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
    #[serde(default = "default_true")]
    pub enable_memory: bool,
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 作业工作目录与轨迹落盘根目录，未设置时用当前目录
    pub session_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            warning_thresholds: default_warning_thresholds(),
            extended_warning_thresholds: default_extended_warning_thresholds(),
            extended_threshold_min_calls: default_extended_threshold_min_calls(),
            max_tool_output_chars: default_max_tool_output_chars(),
            enable_memory: true,
            max_concurrent_tools: default_max_concurrent_tools(),
            tool_timeout_secs: default_tool_timeout_secs(),
            session_dir: None,
        }
    }
}

fn default_max_steps() -> usize {
    20
}

fn default_warning_thresholds() -> Vec<usize> {
    vec![6, 8, 10]
}

fn default_extended_warning_thresholds() -> Vec<usize> {
    vec![8, 10, 12]
}

fn default_extended_threshold_min_calls() -> u32 {
    5
}

fn default_max_tool_output_chars() -> usize {
    50_000
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_tools() -> usize {
    3
}

fn default_tool_timeout_secs() -> u64 {
    300
}

/// [memory] 段：上下文预算
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// 裁剪时保留的最近消息数
    #[serde(default = "default_short_term_messages")]
    pub short_term_messages: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            short_term_messages: default_short_term_messages(),
        }
    }
}

fn default_max_context_tokens() -> usize {
    128_000
}

fn default_short_term_messages() -> usize {
    5
}

/// 从 config 目录加载配置，环境变量 ANALYST__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ANALYST__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ANALYST")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.pool.size, 2);
        assert_eq!(cfg.pool.acquire_timeout_secs, 30);
        assert_eq!(cfg.pool.exec_timeout_secs, 120);
        assert_eq!(cfg.router.cache_ttl_secs, 300);
        assert_eq!(cfg.router.cache_max_size, 100);
        assert_eq!(cfg.orchestrator.max_steps, 20);
        assert_eq!(cfg.orchestrator.warning_thresholds, vec![6, 8, 10]);
        assert_eq!(cfg.orchestrator.extended_warning_thresholds, vec![8, 10, 12]);
        assert_eq!(cfg.orchestrator.max_tool_output_chars, 50_000);
    }

    #[test]
    fn test_missing_model_is_config_error() {
        let cfg = AppConfig::default();
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));

        let mut cfg = AppConfig::default();
        cfg.llm.model = "gpt-4o".into();
        assert!(cfg.validate().is_ok());

        cfg.orchestrator.warning_thresholds = vec![8, 6];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[llm]\nmodel = \"deepseek-chat\"\n\n[pool]\nsize = 4\n\n[orchestrator]\nwarning_thresholds = [5, 7, 9]\n"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.llm.model, "deepseek-chat");
        assert_eq!(cfg.pool.size, 4);
        assert_eq!(cfg.pool.exec_timeout_secs, 120);
        assert_eq!(cfg.orchestrator.warning_thresholds, vec![5, 7, 9]);
        assert_eq!(cfg.memory.short_term_messages, 5);
    }
}
