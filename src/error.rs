//! Error taxonomy for the orchestration core.
//!
//! Every variant here is a terminal reason a [`crate::model::TaskRecord`] can
//! land in `failed`. Variants carry enough context to render a useful
//! `TaskRecord.error` string via `Display`; nothing in this module is ever
//! propagated out of the execution loop (see `engine`).

use thiserror::Error;

/// A reason a task failed, or an operation on the orchestrator was rejected.
#[derive(Debug, Error, Clone)]
pub enum OrchestratorError {
    #[error("tool '{tool}' not found in registry")]
    UnknownTool { tool: String },

    #[error("input validation failed for tool '{tool}': {reason}")]
    ValidationError { tool: String, reason: String },

    #[error("binding error resolving inputs for task '{task_id}': {reason}")]
    BindingError { task_id: String, reason: String },

    #[error("task timed out after {timeout_ms}ms")]
    TimeoutError { timeout_ms: u64 },

    #[error("tool error: {reason}")]
    ToolError { reason: String },

    #[error("transport error dispatching task '{task_id}': {reason}")]
    TransportError { task_id: String, reason: String },

    #[error("configuration error: {reason}")]
    ConfigurationError { reason: String },

    #[error("dependency '{ancestor}' failed")]
    CascadeError { ancestor: String },
}

impl OrchestratorError {
    /// Renders the error the way it is stored into `TaskRecord.error`.
    pub fn to_task_error(&self) -> String {
        self.to_string()
    }
}

/// Errors from building or loading a [`crate::registry::ToolRegistry`].
///
/// These sit above the per-task taxonomy: a malformed schema source is an
/// application wiring mistake, not a task outcome, so callers branch on it
/// with `anyhow` rather than matching the `OrchestratorError` variants.
pub type SetupResult<T> = anyhow::Result<T>;
