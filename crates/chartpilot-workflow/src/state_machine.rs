//! 任务状态机
//!
//! scheduled 是唯一的非终态，终态不可再转换

use chartpilot_core::{PilotError, Result, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 任务状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskEvent {
    /// 执行结果对应的事件
    pub fn from_outcome(success: bool) -> Self {
        if success {
            TaskEvent::Succeeded
        } else {
            TaskEvent::Failed
        }
    }
}

/// 任务状态机
#[derive(Debug)]
pub struct TaskStateMachine {
    transitions: HashMap<(TaskStatus, TaskEvent), TaskStatus>,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        transitions.insert((TaskStatus::Scheduled, TaskEvent::Succeeded), TaskStatus::Completed);
        transitions.insert((TaskStatus::Scheduled, TaskEvent::Failed), TaskStatus::Failed);
        transitions.insert((TaskStatus::Scheduled, TaskEvent::Cancelled), TaskStatus::Cancelled);

        Self { transitions }
    }

    pub fn can_transition(&self, from: TaskStatus, event: TaskEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: TaskStatus, event: TaskEvent) -> Result<TaskStatus> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(PilotError::InvalidStateTransition {
                from: from.to_string(),
                event: format!("{:?}", event),
            }),
        }
    }

    pub fn all_states() -> Vec<TaskStatus> {
        vec![
            TaskStatus::Scheduled,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ]
    }

    /// 当前状态下允许的事件
    pub fn get_possible_events(&self, current: TaskStatus) -> Vec<TaskEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
