//! Analyst - 数据分析助手任务编排器
//!
//! 模块划分：
//! - **agent**: 运行时装配（从配置构建 Orchestrator）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、任务调度、优雅关闭
//! - **llm**: 推理模型抽象与实现（OpenAI 兼容 / Scripted Mock）
//! - **memory**: 对话状态、上下文预算、运行后的记忆提取
//! - **observability**: tracing 初始化
//! - **react**: MODEL ⇄ TOOLS 编排状态机、进度与轨迹
//! - **router**: 请求分流（快速路径、关键词、缓存、模型分类）
//! - **sandbox**: 常驻 Python worker 执行池
//! - **tools**: 工具契约、注册表、执行器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod router;
pub mod sandbox;
pub mod tools;

pub use agent::{build_runtime, build_runtime_with, AnalystRuntime};
pub use react::{Orchestrator, RunRequest};
