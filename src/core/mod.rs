//! 核心层：错误类型、任务调度、优雅关闭

pub mod error;
pub mod shutdown;
pub mod task_scheduler;

pub use error::{AgentError, PoolError};
pub use shutdown::{PoolCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use task_scheduler::TaskScheduler;
