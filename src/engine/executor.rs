//! Per-task dispatch: the validate → resolve → invoke → mark flow shared by
//! server tasks and in-process client tasks, plus the remote-dispatch path.

use std::sync::Arc;
use std::time::Duration;

use crate::error::OrchestratorError;
use crate::model::{ExecutionState, TaskRecord, TaskStatus};

use super::ExecutionEngine;

impl ExecutionEngine {
    pub(super) async fn execute_server_task(
        &self,
        user_id: &str,
        record: TaskRecord,
        state: Arc<ExecutionState>,
    ) {
        let task_id = record.task.task_id.clone();

        if let Err(err) = self.binding_resolver.validate_bindings(&record, &state) {
            self.orchestrator
                .mark_task_failed(user_id, &task_id, err.to_task_error());
            return;
        }

        let Some(executor) = self.services.server_executor.clone() else {
            let err = OrchestratorError::ConfigurationError {
                reason: "server tool executor not configured".to_string(),
            };
            self.orchestrator
                .mark_task_failed(user_id, &task_id, err.to_task_error());
            return;
        };

        let registry = self.orchestrator.registry();
        let resolved = self.binding_resolver.resolve_inputs(&record, &state);
        let resolved = match registry.validate_inputs(&record.task.tool, &resolved) {
            Ok(filled) => filled,
            Err(err) => {
                self.orchestrator
                    .mark_task_failed(user_id, &task_id, err.to_task_error());
                return;
            }
        };
        let resolved = Self::inject_user_id(resolved, user_id);

        self.orchestrator
            .set_resolved_inputs(user_id, &task_id, resolved.clone());
        self.orchestrator.mark_task_running(user_id, &task_id);
        self.log_lifecycle(
            user_id,
            &record,
            record
                .task
                .lifecycle_messages
                .as_ref()
                .and_then(|m| m.on_start.as_deref()),
        );

        let timeout_ms = record.task.control.as_ref().and_then(|c| c.timeout_ms);
        let invocation = executor.execute(&record.task.tool, resolved);

        let outcome = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), invocation).await {
                Ok(result) => result,
                Err(_) => {
                    let err = OrchestratorError::TimeoutError { timeout_ms: ms };
                    self.orchestrator
                        .mark_task_failed(user_id, &task_id, err.to_task_error());
                    return;
                }
            },
            None => invocation.await,
        };

        self.classify_outcome(user_id, &record, outcome);
    }

    pub(super) async fn handle_client_batch(
        &self,
        user_id: &str,
        tasks: Vec<TaskRecord>,
        state: Arc<ExecutionState>,
    ) {
        if tasks.is_empty() {
            return;
        }
        match self.mode {
            super::ExecutionMode::Desktop => self.execute_client_batch_locally(user_id, tasks).await,
            super::ExecutionMode::Remote => self.emit_client_batch_remote(user_id, tasks, state).await,
        }
    }

    /// Sequential by design: chain members are only guaranteed a valid
    /// topological order, not independence, so an earlier member's output
    /// may be exactly what a later member's binding needs. Each member
    /// re-reads live orchestrator state immediately before its own
    /// validate/resolve step rather than trusting the pre-tick snapshot the
    /// batch was discovered against.
    async fn execute_client_batch_locally(&self, user_id: &str, tasks: Vec<TaskRecord>) {
        let Some(executor) = self.services.client_executor.clone() else {
            for record in &tasks {
                let err = OrchestratorError::ConfigurationError {
                    reason: "client tool executor not configured".to_string(),
                };
                self.orchestrator
                    .mark_task_failed(user_id, &record.task.task_id, err.to_task_error());
            }
            return;
        };

        for record in tasks {
            let task_id = record.task.task_id.clone();

            let Some(live_state) = self.orchestrator.get_state(user_id) else {
                continue;
            };

            let dependencies_ready = record.task.depends_on.iter().all(|dep| {
                live_state
                    .get_task(dep)
                    .map(|r| r.status == TaskStatus::Completed)
                    .unwrap_or(false)
            });
            if !dependencies_ready {
                let err = OrchestratorError::BindingError {
                    task_id: task_id.clone(),
                    reason: "a dependency was not yet completed at dispatch time".to_string(),
                };
                self.orchestrator
                    .mark_task_failed(user_id, &task_id, err.to_task_error());
                continue;
            }

            if let Err(err) = self.binding_resolver.validate_bindings(&record, &live_state) {
                self.orchestrator
                    .mark_task_failed(user_id, &task_id, err.to_task_error());
                continue;
            }

            let registry = self.orchestrator.registry();
            let resolved = self.binding_resolver.resolve_inputs(&record, &live_state);
            let resolved = match registry.validate_inputs(&record.task.tool, &resolved) {
                Ok(filled) => filled,
                Err(err) => {
                    self.orchestrator
                        .mark_task_failed(user_id, &task_id, err.to_task_error());
                    continue;
                }
            };
            let resolved = Self::inject_user_id(resolved, user_id);

            self.orchestrator
                .set_resolved_inputs(user_id, &task_id, resolved.clone());
            self.orchestrator.mark_task_running(user_id, &task_id);
            self.log_lifecycle(
                user_id,
                &record,
                record
                    .task
                    .lifecycle_messages
                    .as_ref()
                    .and_then(|m| m.on_start.as_deref()),
            );

            let timeout_ms = record.task.control.as_ref().and_then(|c| c.timeout_ms);
            let invocation = executor.execute(&record.task.tool, resolved);

            let outcome = match timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), invocation).await {
                    Ok(result) => result,
                    Err(_) => {
                        let err = OrchestratorError::TimeoutError { timeout_ms: ms };
                        self.orchestrator
                            .mark_task_failed(user_id, &task_id, err.to_task_error());
                        continue;
                    }
                },
                None => invocation.await,
            };

            self.classify_outcome(user_id, &record, outcome);
        }
    }

    /// Sequential by design: unlike server tasks and the desktop client
    /// path, remote dispatch is a handoff to an external adapter, not a
    /// local invocation worth parallelizing, and acks arrive independently
    /// of dispatch order. Unlike the desktop path, re-reading live state
    /// per member would not help here: a chain member only becomes
    /// `completed` via an ack the transport delivers asynchronously, never
    /// as a side effect of this dispatch loop itself.
    async fn emit_client_batch_remote(
        &self,
        user_id: &str,
        tasks: Vec<TaskRecord>,
        state: Arc<ExecutionState>,
    ) {
        let Some(transport) = self.services.transport.clone() else {
            for record in &tasks {
                let err = OrchestratorError::ConfigurationError {
                    reason: "client transport not configured".to_string(),
                };
                self.orchestrator
                    .mark_task_failed(user_id, &record.task.task_id, err.to_task_error());
            }
            return;
        };

        let registry = self.orchestrator.registry();

        for record in tasks {
            let task_id = record.task.task_id.clone();

            if let Err(err) = self.binding_resolver.validate_bindings(&record, &state) {
                self.orchestrator
                    .mark_task_failed(user_id, &task_id, err.to_task_error());
                continue;
            }
            let resolved = self.binding_resolver.resolve_inputs(&record, &state);
            let resolved = match registry.validate_inputs(&record.task.tool, &resolved) {
                Ok(filled) => filled,
                Err(err) => {
                    self.orchestrator
                        .mark_task_failed(user_id, &task_id, err.to_task_error());
                    continue;
                }
            };

            self.orchestrator
                .set_resolved_inputs(user_id, &task_id, resolved.clone());

            self.log_lifecycle(
                user_id,
                &record,
                record
                    .task
                    .lifecycle_messages
                    .as_ref()
                    .and_then(|m| m.on_start.as_deref()),
            );
            self.orchestrator.mark_task_emitted(user_id, &task_id);

            let mut emitted_record = record.clone();
            emitted_record.resolved_inputs = resolved;

            let accepted = transport.emit_task_single(user_id, &emitted_record).await;
            if !accepted {
                let err = OrchestratorError::TransportError {
                    task_id: task_id.clone(),
                    reason: "adapter rejected dispatch".to_string(),
                };
                self.orchestrator
                    .mark_task_failed(user_id, &task_id, err.to_task_error());
            }
        }
    }
}
