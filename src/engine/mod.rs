//! Execution engine (SPEC_FULL.md §4.4): the concurrent scheduler that
//! discovers runnable batches and drives per-user execution to completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::binding::BindingResolver;
use crate::error::OrchestratorError;
use crate::model::{ExecutionState, TaskOutput, TaskRecord};
use crate::orchestrator::Orchestrator;
use crate::tool::{ClientToolExecutor, ServerToolExecutor};
use crate::transport::ClientTransport;

mod executor;

/// Whether client tasks run in-process (desktop) or are dispatched to a
/// remote client over a transport adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Desktop,
    Remote,
}

/// Receives the three lifecycle messages (`on_start`, `on_success`,
/// `on_failure`) a task declares, for delivery to UI/TTS consumers outside
/// the core. The core itself only logs and calls this sink; it never opens
/// a socket.
pub trait LifecycleSink: Send + Sync {
    fn emit(&self, user_id: &str, task_id: &str, message: &str);
}

/// Tunable loop constants, mirroring SPEC_FULL.md §4.4's named bounds.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_iterations: u32,
    pub max_idle: u32,
    pub idle_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_idle: 3,
            idle_interval: Duration::from_millis(200),
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// The collaborators the engine dispatches through. Any combination may be
/// absent; an absent executor/transport for the locale in effect fails
/// every task of that locale with a `ConfigurationError` rather than
/// stalling.
#[derive(Default, Clone)]
pub struct EngineServices {
    pub server_executor: Option<Arc<dyn ServerToolExecutor>>,
    pub client_executor: Option<Arc<dyn ClientToolExecutor>>,
    pub transport: Option<Arc<dyn ClientTransport>>,
    pub lifecycle: Option<Arc<dyn LifecycleSink>>,
}

/// Drives per-user execution by repeatedly discovering runnable work via
/// the [`Orchestrator`] and dispatching it through [`EngineServices`].
pub struct ExecutionEngine {
    orchestrator: Arc<Orchestrator>,
    binding_resolver: BindingResolver,
    config: EngineConfig,
    mode: ExecutionMode,
    services: EngineServices,
    running: dashmap::DashMap<String, (tokio::task::JoinHandle<()>, CancellationToken)>,
    completion: dashmap::DashMap<String, watch::Sender<bool>>,
}

impl ExecutionEngine {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        mode: ExecutionMode,
        services: EngineServices,
        config: EngineConfig,
    ) -> Self {
        Self {
            orchestrator,
            binding_resolver: BindingResolver::new(),
            config,
            mode,
            services,
            running: dashmap::DashMap::new(),
            completion: dashmap::DashMap::new(),
        }
    }

    /// Idempotent: if an execution activity is already running for this
    /// user, this is a no-op.
    pub fn start(self: &Arc<Self>, user_id: &str) {
        if let Some(entry) = self.running.get(user_id) {
            if !entry.0.is_finished() {
                return;
            }
        }

        let (tx, _rx) = watch::channel(false);
        self.completion.insert(user_id.to_string(), tx);

        let token = CancellationToken::new();
        let engine = Arc::clone(self);
        let user = user_id.to_string();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            engine.run_loop(&user, loop_token).await;
        });
        self.running.insert(user_id.to_string(), (handle, token));
    }

    /// Requests cooperative cancellation of the per-user loop. The loop
    /// observes this at the top of its next iteration and at its idle
    /// sleep; a task already executing may still report completion.
    pub fn stop_execution(&self, user_id: &str) {
        if let Some(entry) = self.running.get(user_id) {
            entry.1.cancel();
        }
    }

    /// Blocks until the user's loop signals completion or `timeout`
    /// elapses, whichever comes first.
    pub async fn wait_for_completion(&self, user_id: &str, timeout: Duration) -> bool {
        let Some(tx) = self.completion.get(user_id).map(|entry| entry.clone()) else {
            tracing::warn!(user_id, "wait_for_completion on an untracked user");
            return false;
        };
        let mut rx = tx.subscribe();
        if *rx.borrow() {
            return true;
        }

        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if *rx.borrow() {
                    return true;
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    async fn run_loop(&self, user_id: &str, token: CancellationToken) {
        let mut idle_count = 0u32;

        for _ in 0..self.config.max_iterations {
            if token.is_cancelled() {
                break;
            }

            let Some(state) = self.orchestrator.get_state(user_id) else {
                break;
            };
            if state.order.is_empty() || !state.has_outstanding_work() {
                break;
            }

            let batch = self.orchestrator.get_executable_batch(user_id);
            if batch.is_empty() {
                idle_count += 1;
                if idle_count >= self.config.max_idle {
                    break;
                }
                tokio::time::sleep(self.config.idle_interval).await;
                continue;
            }
            idle_count = 0;

            // Bindings are resolved against a fresh snapshot taken right
            // after the batch was computed; `get_executable_batch` already
            // guarantees every dependency in this batch is `completed`.
            let snapshot = Arc::new(
                self.orchestrator
                    .get_state(user_id)
                    .unwrap_or_else(|| ExecutionState::new(user_id, chrono::Utc::now())),
            );

            let server_futures = batch
                .server_tasks
                .into_iter()
                .map(|record| self.execute_server_task(user_id, record, Arc::clone(&snapshot)));
            let client_future =
                self.handle_client_batch(user_id, batch.client_tasks, Arc::clone(&snapshot));

            futures::join!(futures::future::join_all(server_futures), client_future);

            if token.is_cancelled() {
                break;
            }
            tokio::time::sleep(self.config.tick_interval).await;
        }

        let summary = self.orchestrator.get_execution_summary(user_id);
        tracing::info!(user_id, ?summary, "execution loop ended");
        if let Some(tx) = self.completion.get(user_id) {
            let _ = tx.send(true);
        }
        self.running.remove(user_id);
    }

    fn log_lifecycle(&self, user_id: &str, record: &TaskRecord, message: Option<&str>) {
        let Some(message) = message else {
            return;
        };
        tracing::info!(user_id, task_id = %record.task.task_id, message, "lifecycle message");
        if let Some(sink) = &self.services.lifecycle {
            sink.emit(user_id, &record.task.task_id, message);
        }
    }

    fn classify_outcome(&self, user_id: &str, record: &TaskRecord, outcome: Option<TaskOutput>) {
        let task_id = &record.task.task_id;
        match outcome {
            Some(output) if output.success => {
                if let Err(err) = self
                    .orchestrator
                    .registry()
                    .validate_output(&record.task.tool, &output.data)
                {
                    tracing::warn!(user_id, task_id = %task_id, %err, "output schema validation failed");
                }
                self.orchestrator.mark_task_completed(user_id, task_id, output);
                self.log_lifecycle(
                    user_id,
                    record,
                    record
                        .task
                        .lifecycle_messages
                        .as_ref()
                        .and_then(|m| m.on_success.as_deref()),
                );
            }
            Some(output) => {
                let reason = output
                    .error
                    .clone()
                    .unwrap_or_else(|| "tool returned failure".to_string());
                self.orchestrator.mark_task_failed(
                    user_id,
                    task_id,
                    OrchestratorError::ToolError { reason }.to_task_error(),
                );
                self.log_lifecycle(
                    user_id,
                    record,
                    record
                        .task
                        .lifecycle_messages
                        .as_ref()
                        .and_then(|m| m.on_failure.as_deref()),
                );
            }
            None => {
                let err = OrchestratorError::UnknownTool {
                    tool: record.task.tool.clone(),
                };
                self.orchestrator
                    .mark_task_failed(user_id, task_id, err.to_task_error());
                self.log_lifecycle(
                    user_id,
                    record,
                    record
                        .task
                        .lifecycle_messages
                        .as_ref()
                        .and_then(|m| m.on_failure.as_deref()),
                );
            }
        }
    }

    fn inject_user_id(mut resolved: HashMap<String, Value>, user_id: &str) -> HashMap<String, Value> {
        resolved.insert("_user_id".to_string(), Value::from(user_id));
        resolved
    }
}
