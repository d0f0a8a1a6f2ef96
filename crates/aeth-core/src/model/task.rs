use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed dispatch operations (§4.5). Wire form uses the `kind:verb` naming
/// the queue's task types are addressed by (`vm:create`, `vm:execute`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "vm:create")]
    VmCreate,
    #[serde(rename = "vm:execute")]
    VmExecute,
    #[serde(rename = "vm:delete")]
    VmDelete,
    #[serde(rename = "workspace:create")]
    WorkspaceCreate,
    #[serde(rename = "workspace:delete")]
    WorkspaceDelete,
    #[serde(rename = "prompt:execute")]
    PromptExecute,
}

impl TaskType {
    /// Default `(max_retries, timeout)` per the §4.5 retry/timeout table.
    /// Types not in the table (workspace:*, prompt:execute) get a
    /// conservative default shared with `vm:execute`.
    pub fn defaults(self) -> (u32, Duration) {
        match self {
            Self::VmCreate => (3, Duration::from_secs(5 * 60)),
            Self::VmExecute => (2, Duration::from_secs(10 * 60)),
            Self::VmDelete => (2, Duration::from_secs(2 * 60)),
            Self::WorkspaceCreate | Self::WorkspaceDelete | Self::PromptExecute => {
                (2, Duration::from_secs(10 * 60))
            }
        }
    }
}

impl TryFrom<String> for TaskType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        serde_json::from_value(Value::String(value)).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Active,
    Completed,
    Failed,
    Retry,
}

impl TryFrom<String> for TaskState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        serde_json::from_value(Value::String(value)).map_err(|e| e.to_string())
    }
}

/// A durable unit of dispatch work (§3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub payload: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Lower values are dispatched earlier.
    pub priority: i32,
    pub deadline: Option<String>,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    /// Earliest time this task may be claimed; pushed forward by the backoff
    /// schedule on each retry (§4.5).
    pub available_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    /// Whether this task has exhausted its retry budget and must be
    /// terminated in `failed` rather than re-enqueued (§4.5).
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_table_matches_spec_defaults() {
        assert_eq!(TaskType::VmCreate.defaults(), (3, Duration::from_secs(300)));
        assert_eq!(TaskType::VmExecute.defaults(), (2, Duration::from_secs(600)));
        assert_eq!(TaskType::VmDelete.defaults(), (2, Duration::from_secs(120)));
    }

    #[test]
    fn retries_exhausted_at_max() {
        let task = Task {
            id: "task-1".to_string(),
            task_type: TaskType::VmCreate,
            payload: Value::Null,
            retry_count: 3,
            max_retries: 3,
            priority: 0,
            deadline: None,
            state: TaskState::Retry,
            result: None,
            error: None,
            worker_id: None,
            available_at: "2026-01-01T00:00:00Z".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(task.retries_exhausted());
    }

    #[test]
    fn retries_not_exhausted_below_max() {
        let mut task = Task {
            id: "task-1".to_string(),
            task_type: TaskType::VmExecute,
            payload: Value::Null,
            retry_count: 1,
            max_retries: 2,
            priority: 0,
            deadline: None,
            state: TaskState::Retry,
            result: None,
            error: None,
            worker_id: None,
            available_at: "2026-01-01T00:00:00Z".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(!task.retries_exhausted());
        task.retry_count = 2;
        assert!(task.retries_exhausted());
    }

    #[test]
    fn task_type_serializes_colon_form() {
        let json = serde_json::to_string(&TaskType::WorkspaceCreate).unwrap();
        assert_eq!(json, "\"workspace:create\"");
    }
}
