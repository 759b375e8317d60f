//! 记忆层：对话状态、上下文预算、运行后的记忆提取

pub mod conversation;
pub mod extraction;
pub mod token_budget;

pub use conversation::{last_user_content, Message, Role, ToolCall};
pub use extraction::{AnalysisDigest, MemoryExtractor};
pub use token_budget::{MemoryManager, TokenBudgetMemory, TokenEstimator};
