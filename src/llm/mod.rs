//! LLM 层：推理模型抽象与实现（OpenAI 兼容 / Scripted Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{Scripted, ScriptedChatModel};
pub use openai::{OpenAiChatModel, TokenUsage};
pub use traits::ChatModel;
