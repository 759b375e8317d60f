//! 单次运行的可变状态：对话历史、迭代计数、升级提示进度、轨迹
//!
//! 历史只追加不重排；唯一的删除是进入 MODEL 步骤时对重复 user 消息的去重。

use std::collections::HashSet;

use crate::config::OrchestratorConfig;
use crate::memory::{Message, Role};
use crate::react::trajectory::Trajectory;

/// 升级提示：迭代数达到阈值时向历史注入一条 user 消息，每个阈值只注入一次
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationSchedule {
    thresholds: Vec<usize>,
    fired: Vec<bool>,
}

impl EscalationSchedule {
    pub fn new(thresholds: Vec<usize>) -> Self {
        let fired = vec![false; thresholds.len()];
        Self { thresholds, fired }
    }

    /// 预计调用次数较多的计划使用更宽松的阈值
    pub fn for_plan(cfg: &OrchestratorConfig, estimated_calls: u32) -> Self {
        if estimated_calls >= cfg.extended_threshold_min_calls {
            Self::new(cfg.extended_warning_thresholds.clone())
        } else {
            Self::new(cfg.warning_thresholds.clone())
        }
    }

    pub fn thresholds(&self) -> &[usize] {
        &self.thresholds
    }

    /// 本轨迭代新越过的阈值对应的提示（按阈值顺序）
    pub fn due(&mut self, iteration: usize) -> Vec<String> {
        let last = self.thresholds.len().saturating_sub(1);
        let mut out = Vec::new();
        for (idx, threshold) in self.thresholds.iter().enumerate() {
            if self.fired[idx] || iteration < *threshold {
                continue;
            }
            self.fired[idx] = true;
            out.push(escalation_text(idx, last, *threshold));
        }
        out
    }

    pub fn fired_count(&self) -> usize {
        self.fired.iter().filter(|f| **f).count()
    }
}

/// 最后一个阈值是强制停止；倒数第二个要求不再调用工具；更早的只是催促
fn escalation_text(idx: usize, last: usize, threshold: usize) -> String {
    if idx == last {
        "🛑 停止! 立即输出当前结果。".to_string()
    } else if idx + 1 == last {
        format!("⚠️ 已用{}步。立即呈现结果，不要再调用工具。", threshold)
    } else {
        format!("⚡ 已用{}步。尽快完成，最多再用2次工具。", threshold)
    }
}

/// 去掉 (role, content) 已出现过的 user 消息；其他角色原样保留，顺序不变
pub fn dedup_user_messages(history: &[Message]) -> Vec<Message> {
    let mut seen: HashSet<(Role, &str)> = HashSet::new();
    history
        .iter()
        .filter(|m| m.role != Role::User || seen.insert((m.role, m.content.as_str())))
        .cloned()
        .collect()
}

/// 一次运行的状态
pub struct RunState<'t> {
    pub history: Vec<Message>,
    /// MODEL 步骤的执行次数（从 1 开始计）
    pub iteration: usize,
    pub escalation: EscalationSchedule,
    pub trajectory: &'t mut Trajectory,
}

impl<'t> RunState<'t> {
    pub fn new(history: Vec<Message>, escalation: EscalationSchedule, trajectory: &'t mut Trajectory) -> Self {
        Self {
            history,
            iteration: 0,
            escalation,
            trajectory,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.history.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;

    #[test]
    fn test_dedup_keeps_first_user_occurrence_only() {
        let history = vec![
            Message::system("sys"),
            Message::user("A"),
            Message::assistant("A"),
            Message::user("B"),
            Message::user("A"),
            Message::assistant("A"),
        ];
        let deduped = dedup_user_messages(&history);
        let contents: Vec<_> = deduped.iter().map(|m| (m.role, m.content.as_str())).collect();
        assert_eq!(
            contents,
            vec![
                (Role::System, "sys"),
                (Role::User, "A"),
                (Role::Assistant, "A"),
                (Role::User, "B"),
                (Role::Assistant, "A"),
            ]
        );
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let history = vec![
            Message::system("sys"),
            Message::user("A"),
            Message::assistant_with_tools("", vec![ToolCall::new("c1", "execute_sql", "{}")]),
            Message::tool("c1", "A"),
            Message::user("B"),
            Message::user("A"),
            Message::assistant("B"),
            Message::user("B"),
            Message::tool("c1", "A"),
            Message::user("C"),
        ];
        let once = dedup_user_messages(&history);
        let twice = dedup_user_messages(&once);
        assert_eq!(twice, once);
        assert_eq!(once.iter().filter(|m| m.role == Role::User).count(), 3);
        assert_eq!(once.len(), history.len() - 2);
    }

    #[test]
    fn test_escalation_fires_once_per_threshold() {
        let mut schedule = EscalationSchedule::new(vec![6, 8, 10]);
        for i in 1..6 {
            assert!(schedule.due(i).is_empty());
        }
        let at6 = schedule.due(6);
        assert_eq!(at6.len(), 1);
        assert!(at6[0].contains("已用6步"));
        assert!(schedule.due(7).is_empty());
        assert!(schedule.due(8)[0].contains("不要再调用工具"));
        assert!(schedule.due(10)[0].starts_with("🛑"));
        assert!(schedule.due(11).is_empty());
        assert_eq!(schedule.fired_count(), 3);
    }

    #[test]
    fn test_extended_thresholds_for_large_plans() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(EscalationSchedule::for_plan(&cfg, 3).thresholds(), &[6, 8, 10]);
        assert_eq!(EscalationSchedule::for_plan(&cfg, 6).thresholds(), &[8, 10, 12]);
    }
}
