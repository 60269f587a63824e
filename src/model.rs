//! Data model: the immutable `Task` a planner produces, the mutable
//! `TaskRecord` the orchestrator owns, and the per-user `ExecutionState`
//! that aggregates them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a task's tool body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    Server,
    Client,
}

/// Informational lifecycle messages a consumer (UI/TTS) may subscribe to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleMessages {
    #[serde(default)]
    pub on_start: Option<String>,
    #[serde(default)]
    pub on_success: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
}

/// Informational per-task control knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskControl {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// An immutable task definition produced by an upstream planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub tool: String,
    pub execution_target: ExecutionTarget,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub input_bindings: HashMap<String, String>,
    #[serde(default)]
    pub lifecycle_messages: Option<LifecycleMessages>,
    #[serde(default)]
    pub control: Option<TaskControl>,
}

/// The typed result of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub success: bool,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskOutput {
    pub fn success(data: HashMap<String, Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: HashMap::new(),
            error: Some(error.into()),
        }
    }

    /// Serializes this output the way binding expressions navigate it:
    /// `{success, data, error}`.
    pub fn to_navigable(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The state machine a `TaskRecord` traverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Emitted,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether `self -> next` is an allowed edge in the state machine
    /// described in SPEC_FULL.md §4.2.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Emitted)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Emitted, Completed)
                | (Emitted, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// The runtime wrapper the Orchestrator owns for every registered task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub resolved_inputs: HashMap<String, Value>,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub emitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub ack_received_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl TaskRecord {
    pub fn new_pending(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            resolved_inputs: HashMap::new(),
            output: None,
            error: None,
            started_at: None,
            emitted_at: None,
            completed_at: None,
            ack_received_at: None,
            duration_ms: None,
        }
    }

    /// A record that is born already `failed`, for registration-time errors
    /// (unknown tool, dangling dependency). The full `Task` is still stored
    /// so callers observing the state see the complete plan.
    pub fn new_failed(task: Task, error: impl Into<String>) -> Self {
        Self {
            task,
            status: TaskStatus::Failed,
            resolved_inputs: HashMap::new(),
            output: None,
            error: Some(error.into()),
            started_at: None,
            emitted_at: None,
            completed_at: None,
            ack_received_at: None,
            duration_ms: None,
        }
    }
}

/// A per-user aggregate of every task registered for that user.
///
/// Task id order is retained separately from the map so ordering
/// guarantees (discovery order for server tasks, chain-head order for
/// client tasks) don't depend on hash-map iteration order.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub user_id: String,
    pub tasks: HashMap<String, TaskRecord>,
    pub order: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            tasks: HashMap::new(),
            order: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_task(&mut self, record: TaskRecord) {
        let id = record.task.task_id.clone();
        if !self.tasks.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.tasks.insert(id, record);
    }

    pub fn get_task(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub fn get_task_mut(&mut self, task_id: &str) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(task_id)
    }

    /// Tasks with the given status, in registration order.
    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<&TaskRecord> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|r| r.status == status)
            .collect()
    }

    pub fn get_completed_task_ids(&self) -> std::collections::HashSet<String> {
        self.order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .map(|r| r.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn get_task_output(&self, task_id: &str) -> Option<&TaskOutput> {
        self.tasks.get(task_id).and_then(|r| r.output.as_ref())
    }

    /// True while any task could still make forward progress.
    pub fn has_outstanding_work(&self) -> bool {
        self.order.iter().any(|id| {
            self.tasks
                .get(id)
                .map(|r| {
                    matches!(
                        r.status,
                        TaskStatus::Pending | TaskStatus::Running | TaskStatus::Emitted
                    )
                })
                .unwrap_or(false)
        })
    }
}

/// The result of a single `get_executable_batch` call.
#[derive(Debug, Clone, Default)]
pub struct TaskBatch {
    pub server_tasks: Vec<TaskRecord>,
    pub client_tasks: Vec<TaskRecord>,
}

impl TaskBatch {
    pub fn is_empty(&self) -> bool {
        self.server_tasks.is_empty() && self.client_tasks.is_empty()
    }
}

/// Per-status task counts, as returned by `get_execution_summary`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub emitted: usize,
    pub completed: usize,
    pub failed: usize,
}

impl From<&ExecutionState> for ExecutionSummary {
    fn from(state: &ExecutionState) -> Self {
        let mut summary = ExecutionSummary {
            total: state.order.len(),
            ..Default::default()
        };
        for id in &state.order {
            let Some(record) = state.tasks.get(id) else {
                continue;
            };
            match record.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Emitted => summary.emitted += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}
