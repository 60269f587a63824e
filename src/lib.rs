//! Core library for DAG-based tool invocation orchestration across server
//! and client execution locales.
//!
//! ## Task graph
//! [`model`] defines the data a planner produces (`Task`) and the runtime
//! wrapper the orchestrator owns (`TaskRecord`, `ExecutionState`).
//!
//! ## Orchestration
//! [`orchestrator`] holds per-user task graphs and their state machines.
//! [`binding`] resolves `$.task_id.path` expressions between dependent
//! tasks. [`registry`] validates tool inputs/outputs against declared
//! schemas.
//!
//! ## Execution
//! [`engine`] drives the per-user loop that discovers runnable batches and
//! dispatches them through [`tool`] (server/desktop-client) or
//! [`transport`] (remote client).
//!
//! ## Errors
//! [`error`] defines the per-task error taxonomy surfaced through
//! `TaskRecord::error`.

pub mod binding;
pub mod engine;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod tool;
pub mod transport;

pub use binding::BindingResolver;
pub use engine::{EngineConfig, EngineServices, ExecutionEngine, ExecutionMode, LifecycleSink};
pub use error::OrchestratorError;
pub use model::{
    ExecutionState, ExecutionSummary, ExecutionTarget, LifecycleMessages, Task, TaskBatch,
    TaskControl, TaskOutput, TaskRecord, TaskStatus,
};
pub use orchestrator::Orchestrator;
pub use registry::{FieldSchema, FieldType, InMemorySchemaSource, JsonSchemaSource, ToolRegistry, ToolSchema};
pub use tool::{ClientToolExecutor, ServerToolExecutor, ToolBody, ToolHandle, ToolTable};
pub use transport::ClientTransport;
