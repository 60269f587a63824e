//! Binding resolver (SPEC_FULL.md §4.3): dereferences `$.task_id.segment...`
//! expressions against completed task outputs.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::OrchestratorError;
use crate::model::{ExecutionState, TaskRecord, TaskStatus};

/// Stateless - a marker type so binding resolution reads as an explicit
/// collaborator (matching the Orchestrator/Tool Registry shape) rather than
/// a bag of free functions.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindingResolver;

impl BindingResolver {
    pub fn new() -> Self {
        Self
    }

    /// Produces the effective input mapping for `record` given the current
    /// state. Follows the three-step resolution contract: literal inputs,
    /// then pre-resolved inputs, then bindings for anything still unset.
    pub fn resolve_inputs(
        &self,
        record: &TaskRecord,
        state: &ExecutionState,
    ) -> HashMap<String, Value> {
        let mut resolved = record.task.inputs.clone();
        resolved.extend(record.resolved_inputs.clone());

        for (name, expr) in &record.task.input_bindings {
            if resolved.contains_key(name) {
                continue;
            }
            match resolve_binding(expr, state) {
                Some(value) => {
                    tracing::info!(binding = %expr, field = %name, "resolved binding");
                    resolved.insert(name.clone(), value);
                }
                None => {
                    tracing::warn!(binding = %expr, field = %name, "could not resolve binding");
                }
            }
        }

        resolved
    }

    /// Checks that every binding not shadowed by a literal input resolves
    /// cleanly: the referenced task exists, is `completed`, and the whole
    /// path dereferences. A task whose bindings fail this check must not be
    /// scheduled.
    pub fn validate_bindings(
        &self,
        record: &TaskRecord,
        state: &ExecutionState,
    ) -> Result<(), OrchestratorError> {
        for (name, expr) in &record.task.input_bindings {
            if record.task.inputs.contains_key(name) {
                continue;
            }
            if resolve_binding(expr, state).is_none() {
                return Err(OrchestratorError::BindingError {
                    task_id: record.task.task_id.clone(),
                    reason: format!("binding '{expr}' for field '{name}' did not resolve"),
                });
            }
        }
        Ok(())
    }
}

fn resolve_binding(expr: &str, state: &ExecutionState) -> Option<Value> {
    let rest = expr.strip_prefix("$.")?;
    let mut parts = rest.split('.');
    let task_id = parts.next()?;
    let path: Vec<&str> = parts.collect();
    if path.is_empty() {
        return None;
    }

    let referenced = state.get_task(task_id)?;
    if referenced.status != TaskStatus::Completed {
        return None;
    }
    let output = referenced.output.as_ref()?;
    let mut current = output.to_navigable();

    for segment in path {
        current = navigate(&current, segment)?;
    }
    Some(current)
}

fn navigate(current: &Value, segment: &str) -> Option<Value> {
    match current {
        Value::Object(map) => map.get(segment).cloned(),
        Value::Array(items) => {
            let index: usize = segment.parse().ok()?;
            items.get(index).cloned()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionTarget, Task, TaskOutput, TaskRecord};
    use chrono::Utc;

    fn completed_task(id: &str, data: HashMap<String, Value>) -> TaskRecord {
        let mut record = TaskRecord::new_pending(Task {
            task_id: id.to_string(),
            tool: "stub".to_string(),
            execution_target: ExecutionTarget::Server,
            depends_on: vec![],
            inputs: HashMap::new(),
            input_bindings: HashMap::new(),
            lifecycle_messages: None,
            control: None,
        });
        record.status = TaskStatus::Completed;
        record.output = Some(TaskOutput::success(data));
        record
    }

    fn state_with(records: Vec<TaskRecord>) -> ExecutionState {
        let mut state = ExecutionState::new("user-1", Utc::now());
        for record in records {
            state.add_task(record);
        }
        state
    }

    #[test]
    fn resolves_nested_object_path() {
        let mut data = HashMap::new();
        data.insert("results".to_string(), Value::from("hello"));
        let state = state_with(vec![completed_task("A", data)]);

        let value = resolve_binding("$.A.data.results", &state).unwrap();
        assert_eq!(value, Value::from("hello"));
    }

    #[test]
    fn resolves_array_index_segment() {
        let mut data = HashMap::new();
        data.insert(
            "items".to_string(),
            Value::Array(vec![Value::from("first"), Value::from("second")]),
        );
        let state = state_with(vec![completed_task("A", data)]);

        let value = resolve_binding("$.A.data.items.1", &state).unwrap();
        assert_eq!(value, Value::from("second"));
    }

    #[test]
    fn array_index_out_of_range_is_unresolved() {
        let mut data = HashMap::new();
        data.insert("items".to_string(), Value::Array(vec![Value::from("only")]));
        let state = state_with(vec![completed_task("A", data)]);

        assert!(resolve_binding("$.A.data.items.5", &state).is_none());
    }

    #[test]
    fn empty_path_is_unresolved() {
        let state = state_with(vec![completed_task("A", HashMap::new())]);
        assert!(resolve_binding("$.A", &state).is_none());
    }

    #[test]
    fn missing_intermediate_key_is_unresolved() {
        let state = state_with(vec![completed_task("A", HashMap::new())]);
        assert!(resolve_binding("$.A.data.missing", &state).is_none());
    }

    #[test]
    fn uncompleted_dependency_is_unresolved() {
        let mut record = completed_task("A", HashMap::new());
        record.status = TaskStatus::Running;
        record.output = None;
        let state = state_with(vec![record]);
        assert!(resolve_binding("$.A.data.anything", &state).is_none());
    }

    #[test]
    fn literal_input_shadows_binding() {
        let mut data = HashMap::new();
        data.insert("results".to_string(), Value::from("hello"));
        let mut state = state_with(vec![completed_task("A", data)]);

        let mut inputs = HashMap::new();
        inputs.insert("content".to_string(), Value::from("literal"));
        let mut bindings = HashMap::new();
        bindings.insert("content".to_string(), "$.A.data.results".to_string());
        let task = Task {
            task_id: "B".to_string(),
            tool: "stub".to_string(),
            execution_target: ExecutionTarget::Client,
            depends_on: vec!["A".to_string()],
            inputs,
            input_bindings: bindings,
            lifecycle_messages: None,
            control: None,
        };
        let record = TaskRecord::new_pending(task);
        state.add_task(record.clone());

        let resolver = BindingResolver::new();
        let resolved = resolver.resolve_inputs(&record, &state);
        assert_eq!(resolved.get("content"), Some(&Value::from("literal")));
    }

    #[test]
    fn shadowed_binding_does_not_block_validation() {
        let mut state = state_with(vec![]);
        let mut inputs = HashMap::new();
        inputs.insert("content".to_string(), Value::from("literal"));
        let mut bindings = HashMap::new();
        bindings.insert("content".to_string(), "$.missing.data.x".to_string());
        let task = Task {
            task_id: "B".to_string(),
            tool: "stub".to_string(),
            execution_target: ExecutionTarget::Client,
            depends_on: vec![],
            inputs,
            input_bindings: bindings,
            lifecycle_messages: None,
            control: None,
        };
        let record = TaskRecord::new_pending(task);
        state.add_task(record.clone());

        let resolver = BindingResolver::new();
        assert!(resolver.validate_bindings(&record, &state).is_ok());
    }
}
