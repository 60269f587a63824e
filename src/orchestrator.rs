//! Orchestrator (SPEC_FULL.md §4.2): per-user ownership of the task graph
//! and its state machine. Every mutation is serialized by a per-user lock
//! that is never held across a suspension point - the lock type itself
//! (`parking_lot::Mutex`) cannot be held across `.await`, so that
//! requirement is enforced by the compiler rather than by convention.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::OrchestratorError;
use crate::model::{
    ExecutionState, ExecutionSummary, ExecutionTarget, Task, TaskBatch, TaskOutput, TaskRecord,
    TaskStatus,
};
use crate::registry::ToolRegistry;

/// Per-user, thread-safe ownership of the task graph and its state machine.
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    states: DashMap<String, Arc<Mutex<ExecutionState>>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            states: DashMap::new(),
        }
    }

    fn with_state<F, R>(&self, user_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut ExecutionState) -> R,
    {
        let state_arc = self.states.get(user_id)?.clone();
        let mut state = state_arc.lock();
        Some(f(&mut state))
    }

    /// Creates or extends the user's state. Tasks whose tool is unknown, or
    /// whose `depends_on` references an id absent from the state, are
    /// registered anyway but born `failed` - the full plan is always
    /// observable, never silently dropped. Re-registering a task id already
    /// present in the state is a no-op for that id (idempotent
    /// registration, invariant 6).
    pub fn register_tasks(&self, user_id: &str, tasks: Vec<Task>) {
        let now = Utc::now();
        let state_arc = self
            .states
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ExecutionState::new(user_id, now))))
            .clone();
        let mut state = state_arc.lock();

        for task in tasks {
            if state.tasks.contains_key(&task.task_id) {
                tracing::info!(task_id = %task.task_id, "skipping already-registered task");
                continue;
            }
            if !self.registry.has(&task.tool) {
                let err = OrchestratorError::UnknownTool {
                    tool: task.tool.clone(),
                };
                tracing::warn!(task_id = %task.task_id, tool = %task.tool, "unknown tool at registration");
                state.add_task(TaskRecord::new_failed(task, err.to_task_error()));
                continue;
            }
            state.add_task(TaskRecord::new_pending(task));
        }

        let mut dangling: Vec<(String, String)> = Vec::new();
        for id in &state.order {
            let record = &state.tasks[id];
            if record.status != TaskStatus::Pending {
                continue;
            }
            for dep in &record.task.depends_on {
                if !state.tasks.contains_key(dep) {
                    dangling.push((id.clone(), dep.clone()));
                    break;
                }
            }
        }
        for (id, dep) in dangling {
            let reason = format!("depends_on references unknown task '{dep}'");
            if let Some(record) = state.tasks.get_mut(&id) {
                record.status = TaskStatus::Failed;
                record.error = Some(reason);
                record.completed_at = Some(Utc::now());
            }
            cascade_failure(&mut state, &id);
        }
        state.updated_at = Utc::now();
    }

    /// Pending tasks whose dependencies are all `completed`, partitioned by
    /// locale; client tasks are grouped into contiguous chains. Never
    /// raises - a user with no state yields an empty batch.
    pub fn get_executable_batch(&self, user_id: &str) -> TaskBatch {
        let Some(state_arc) = self.states.get(user_id).map(|e| e.clone()) else {
            return TaskBatch::default();
        };
        let state = state_arc.lock();

        let completed = state.get_completed_task_ids();
        let pending = state.get_tasks_by_status(TaskStatus::Pending);
        let mut batch = TaskBatch::default();
        let mut processed: HashSet<String> = HashSet::new();

        for task in &pending {
            let id = &task.task.task_id;
            if processed.contains(id) {
                continue;
            }
            if !dependencies_met(task, &completed) {
                continue;
            }
            match task.task.execution_target {
                ExecutionTarget::Server => {
                    batch.server_tasks.push((*task).clone());
                    processed.insert(id.clone());
                }
                ExecutionTarget::Client => {
                    let chain = client_chain_from(task, &pending, &completed);
                    for linked in &chain {
                        processed.insert(linked.task.task_id.clone());
                    }
                    batch.client_tasks.extend(chain);
                }
            }
        }

        batch
    }

    pub fn mark_task_running(&self, user_id: &str, task_id: &str) {
        self.with_state(user_id, |state| {
            transition(state, task_id, TaskStatus::Running, |record, now| {
                record.started_at = Some(now);
            });
        });
    }

    pub fn mark_task_completed(&self, user_id: &str, task_id: &str, output: TaskOutput) {
        self.with_state(user_id, |state| {
            transition(state, task_id, TaskStatus::Completed, |record, now| {
                record.duration_ms = record.started_at.map(|started| (now - started).num_milliseconds());
                record.output = Some(output);
                record.completed_at = Some(now);
            });
        });
    }

    pub fn mark_task_failed(&self, user_id: &str, task_id: &str, error: impl Into<String>) {
        let error = error.into();
        self.with_state(user_id, |state| {
            let transitioned = transition(state, task_id, TaskStatus::Failed, |record, now| {
                record.error = Some(error.clone());
                record.completed_at = Some(now);
            });
            if transitioned {
                cascade_failure(state, task_id);
            }
        });
    }

    /// Exposes the registry backing this orchestrator so collaborators
    /// (the execution engine) can run input/output validation at
    /// invocation time without the orchestrator doing it on their behalf.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    /// Stores the effective input mapping computed for a task just before
    /// it leaves `pending`, so `resolved_inputs` is never observed empty
    /// alongside a populated `started_at`/`emitted_at`.
    pub fn set_resolved_inputs(&self, user_id: &str, task_id: &str, inputs: HashMap<String, Value>) {
        self.with_state(user_id, |state| {
            if let Some(record) = state.get_task_mut(task_id) {
                record.resolved_inputs = inputs;
            }
        });
    }

    pub fn mark_task_emitted(&self, user_id: &str, task_id: &str) {
        self.with_state(user_id, |state| {
            transition(state, task_id, TaskStatus::Emitted, |record, now| {
                record.emitted_at = Some(now);
                record.started_at = Some(now);
            });
        });
    }

    /// Resolves the outcome of a remote client dispatch. Does not hold the
    /// per-user lock across the delegation to `mark_task_completed` /
    /// `mark_task_failed` - each of those acquires it independently - so
    /// this never attempts a nested lock acquisition.
    pub fn handle_client_ack(&self, user_id: &str, task_id: &str, output: TaskOutput) {
        self.with_state(user_id, |state| {
            if let Some(record) = state.get_task_mut(task_id) {
                record.ack_received_at = Some(Utc::now());
            }
        });

        if output.success {
            self.mark_task_completed(user_id, task_id, output);
        } else {
            let error = output
                .error
                .clone()
                .unwrap_or_else(|| "client execution failed".to_string());
            self.mark_task_failed(user_id, task_id, error);
        }
    }

    pub fn get_state(&self, user_id: &str) -> Option<ExecutionState> {
        self.with_state(user_id, |state| state.clone())
    }

    pub fn get_task(&self, user_id: &str, task_id: &str) -> Option<TaskRecord> {
        self.with_state(user_id, |state| state.get_task(task_id).cloned())
            .flatten()
    }

    pub fn get_execution_summary(&self, user_id: &str) -> Option<ExecutionSummary> {
        self.with_state(user_id, |state| ExecutionSummary::from(&*state))
    }

    pub fn cleanup_user_state(&self, user_id: &str) {
        self.states.remove(user_id);
    }
}

fn dependencies_met(task: &TaskRecord, completed: &HashSet<String>) -> bool {
    task.task.depends_on.iter().all(|dep| completed.contains(dep))
}

/// Greedily extends a chain of client tasks starting at `start`: repeatedly
/// looks for a pending client task that depends directly on the chain's
/// current tail and whose every dependency is satisfied by completed tasks
/// or earlier chain members. Restarts the scan from the top after every
/// addition and stops the first full pass that adds nothing - a task is
/// never reconsidered once absorbed into the chain.
fn client_chain_from(
    start: &TaskRecord,
    all_pending: &[&TaskRecord],
    completed: &HashSet<String>,
) -> Vec<TaskRecord> {
    let mut chain: Vec<TaskRecord> = vec![start.clone()];
    let mut chain_ids: HashSet<String> = [start.task.task_id.clone()].into_iter().collect();
    let mut current_id = start.task.task_id.clone();

    loop {
        let mut found_next = false;
        for candidate in all_pending {
            let candidate_id = &candidate.task.task_id;
            if chain_ids.contains(candidate_id) {
                continue;
            }
            if candidate.task.execution_target != ExecutionTarget::Client {
                continue;
            }
            if !candidate.task.depends_on.iter().any(|dep| dep == &current_id) {
                continue;
            }
            let satisfied = candidate
                .task
                .depends_on
                .iter()
                .all(|dep| chain_ids.contains(dep) || completed.contains(dep));
            if satisfied {
                chain.push((*candidate).clone());
                chain_ids.insert(candidate_id.clone());
                current_id = candidate_id.clone();
                found_next = true;
                break;
            }
        }
        if !found_next {
            break;
        }
    }

    chain
}

fn transition(
    state: &mut ExecutionState,
    task_id: &str,
    next: TaskStatus,
    apply: impl FnOnce(&mut TaskRecord, DateTime<Utc>),
) -> bool {
    let now = Utc::now();
    let Some(record) = state.tasks.get_mut(task_id) else {
        tracing::warn!(task_id, "transition requested on unknown task");
        return false;
    };
    if !record.status.can_transition_to(next) {
        tracing::warn!(
            task_id,
            from = ?record.status,
            to = ?next,
            "illegal state transition ignored"
        );
        return false;
    }
    record.status = next;
    apply(record, now);
    state.updated_at = now;
    true
}

/// Recursively fails every pending task that transitively depends on
/// `failed_id`. Must only be called while the caller already holds the
/// per-user lock (it does not acquire one itself).
fn cascade_failure(state: &mut ExecutionState, failed_id: &str) {
    let dependents: Vec<String> = state
        .order
        .iter()
        .filter(|id| {
            state
                .tasks
                .get(*id)
                .map(|r| r.status == TaskStatus::Pending && r.task.depends_on.iter().any(|d| d == failed_id))
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    for dependent_id in dependents {
        if let Some(record) = state.tasks.get_mut(&dependent_id) {
            record.status = TaskStatus::Failed;
            record.error = Some(format!("Dependency '{failed_id}' failed"));
            record.completed_at = Some(Utc::now());
        }
        tracing::warn!(task_id = %dependent_id, ancestor = %failed_id, "cascading failure");
        cascade_failure(state, &dependent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionTarget, Task};
    use crate::registry::{InMemorySchemaSource, ToolSchema};
    use std::collections::HashMap;

    fn orchestrator_with_tools(names: &[&str]) -> Orchestrator {
        let registry = ToolRegistry::new();
        let mut table = HashMap::new();
        for name in names {
            table.insert(name.to_string(), ToolSchema::default());
        }
        registry.load(&InMemorySchemaSource::new(table)).unwrap();
        Orchestrator::new(Arc::new(registry))
    }

    fn task(id: &str, target: ExecutionTarget, depends_on: Vec<&str>) -> Task {
        Task {
            task_id: id.to_string(),
            tool: "stub".to_string(),
            execution_target: target,
            depends_on: depends_on.into_iter().map(String::from).collect(),
            inputs: HashMap::new(),
            input_bindings: HashMap::new(),
            lifecycle_messages: None,
            control: None,
        }
    }

    #[test]
    fn register_tasks_fails_unknown_tool_but_keeps_the_task() {
        let orchestrator = orchestrator_with_tools(&[]);
        orchestrator.register_tasks("u1", vec![task("A", ExecutionTarget::Server, vec![])]);
        let record = orchestrator.get_task("u1", "A").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("not found in registry"));
    }

    #[test]
    fn register_tasks_fails_dangling_dependency() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks(
            "u1",
            vec![task("B", ExecutionTarget::Server, vec!["missing"])],
        );
        let record = orchestrator.get_task("u1", "B").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
    }

    #[test]
    fn register_tasks_is_idempotent_for_existing_ids() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks("u1", vec![task("A", ExecutionTarget::Server, vec![])]);
        orchestrator.mark_task_running("u1", "A");
        orchestrator.mark_task_completed(
            "u1",
            "A",
            TaskOutput::success(HashMap::new()),
        );
        orchestrator.register_tasks("u1", vec![task("A", ExecutionTarget::Server, vec![])]);
        let record = orchestrator.get_task("u1", "A").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[test]
    fn get_executable_batch_returns_only_ready_server_tasks() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks(
            "u1",
            vec![
                task("A", ExecutionTarget::Server, vec![]),
                task("B", ExecutionTarget::Server, vec!["A"]),
            ],
        );
        let batch = orchestrator.get_executable_batch("u1");
        assert_eq!(batch.server_tasks.len(), 1);
        assert_eq!(batch.server_tasks[0].task.task_id, "A");
    }

    #[test]
    fn client_tasks_returned_as_a_single_chain() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks(
            "u1",
            vec![
                task("A", ExecutionTarget::Client, vec![]),
                task("B", ExecutionTarget::Client, vec!["A"]),
                task("C", ExecutionTarget::Client, vec!["B"]),
            ],
        );
        let batch = orchestrator.get_executable_batch("u1");
        assert!(batch.server_tasks.is_empty());
        assert_eq!(batch.client_tasks.len(), 3);
        let ids: Vec<&str> = batch
            .client_tasks
            .iter()
            .map(|t| t.task.task_id.as_str())
            .collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn illegal_transition_is_ignored() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks("u1", vec![task("A", ExecutionTarget::Server, vec![])]);
        orchestrator.mark_task_completed("u1", "A", TaskOutput::success(HashMap::new()));
        // Pending -> Completed direct is illegal; task never ran.
        let record = orchestrator.get_task("u1", "A").unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[test]
    fn mark_task_failed_cascades_to_dependents() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks(
            "u1",
            vec![
                task("A", ExecutionTarget::Server, vec![]),
                task("B", ExecutionTarget::Server, vec!["A"]),
                task("C", ExecutionTarget::Server, vec!["B"]),
            ],
        );
        orchestrator.mark_task_running("u1", "A");
        orchestrator.mark_task_failed("u1", "A", "boom");

        let b = orchestrator.get_task("u1", "B").unwrap();
        let c = orchestrator.get_task("u1", "C").unwrap();
        assert_eq!(b.status, TaskStatus::Failed);
        assert_eq!(c.status, TaskStatus::Failed);
        assert!(b.error.unwrap().contains('A'));
    }

    #[test]
    fn handle_client_ack_success_completes_task() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks("u1", vec![task("A", ExecutionTarget::Client, vec![])]);
        orchestrator.mark_task_emitted("u1", "A");
        orchestrator.handle_client_ack("u1", "A", TaskOutput::success(HashMap::new()));
        let record = orchestrator.get_task("u1", "A").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.ack_received_at.is_some());
    }

    #[test]
    fn handle_client_ack_failure_fails_task() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks("u1", vec![task("A", ExecutionTarget::Client, vec![])]);
        orchestrator.mark_task_emitted("u1", "A");
        orchestrator.handle_client_ack("u1", "A", TaskOutput::failure("denied"));
        let record = orchestrator.get_task("u1", "A").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
    }

    #[test]
    fn cleanup_user_state_discards_everything() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks("u1", vec![task("A", ExecutionTarget::Server, vec![])]);
        orchestrator.cleanup_user_state("u1");
        assert!(orchestrator.get_state("u1").is_none());
    }

    #[test]
    fn execution_summary_counts_by_status() {
        let orchestrator = orchestrator_with_tools(&["stub"]);
        orchestrator.register_tasks(
            "u1",
            vec![
                task("A", ExecutionTarget::Server, vec![]),
                task("B", ExecutionTarget::Server, vec![]),
            ],
        );
        orchestrator.mark_task_running("u1", "A");
        orchestrator.mark_task_completed("u1", "A", TaskOutput::success(HashMap::new()));
        let summary = orchestrator.get_execution_summary("u1").unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.pending, 1);
    }
}
