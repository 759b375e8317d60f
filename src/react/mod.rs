//! 编排状态机：MODEL ⇄ TOOLS 循环、升级提示、去重、诊断、进度与轨迹

pub mod diagnostics;
pub mod events;
pub mod loop_;
pub mod state;
pub mod steps;
pub mod trajectory;

pub use events::{ProgressSender, ProgressStage, ProgressUpdate};
pub use loop_::{Orchestrator, RunRequest};
pub use state::{dedup_user_messages, EscalationSchedule, RunState};
pub use steps::{drive, ModelStep, NextStep, RunContext, Step, ToolsStep};
pub use trajectory::{escape_for_training, JsonFileTrajectorySink, StepKind, Trajectory, TrajectorySink, TrajectoryStep};
