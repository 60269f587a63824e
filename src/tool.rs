//! Tool invocation abstraction (SPEC_FULL.md §4.5): the uniform contract
//! every concrete tool honors, and the two locale-specific executor traits
//! the engine dispatches through.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;

use crate::model::TaskOutput;
use crate::registry::{validate_against, ToolRegistry, ToolSchema};

/// The tool-specific body every concrete tool implements. This is the
/// `_execute` referenced in SPEC_FULL.md §4.5 step 2 - everything around it
/// (schema validation, panic containment) is handled once by [`ToolHandle`].
#[async_trait]
pub trait ToolBody: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, inputs: HashMap<String, Value>) -> TaskOutput;
}

/// Wraps a [`ToolBody`] with the public `execute` contract: input
/// validation, body invocation, output validation, and exception
/// containment, none of which a tool body has to implement itself.
pub struct ToolHandle {
    body: Box<dyn ToolBody>,
    params_schema: RwLock<Option<ToolSchema>>,
}

impl ToolHandle {
    pub fn new(body: impl ToolBody + 'static) -> Self {
        Self {
            body: Box::new(body),
            params_schema: RwLock::new(None),
        }
    }

    pub fn tool_name(&self) -> &str {
        self.body.name()
    }

    /// Called once after registry load; the tool stores the schema for use
    /// in `execute`. Idempotent in the sense that later calls simply
    /// replace the stored schema.
    pub fn set_schemas(&self, params_schema: Option<ToolSchema>) {
        *self.params_schema.write() = params_schema;
    }

    /// The public entry point: validated inputs in, typed output out, with
    /// no exception ever escaping to the caller.
    pub async fn execute(&self, inputs: HashMap<String, Value>) -> TaskOutput {
        let schema = self.params_schema.read().clone();

        let inputs = match &schema {
            Some(schema) => match validate_against(&schema.params_schema, &inputs, self.tool_name()) {
                Ok(filled) => filled,
                Err(err) => return TaskOutput::failure(format!("Input validation failed: {err}")),
            },
            None => inputs,
        };

        let result = AssertUnwindSafe(self.body.invoke(inputs)).catch_unwind().await;
        match result {
            Ok(output) => {
                if output.success {
                    if let Some(schema) = &schema {
                        if let Err(err) = validate_against(&schema.output_schema, &output.data, self.tool_name()) {
                            tracing::warn!(tool = self.tool_name(), %err, "output schema validation failed");
                        }
                    }
                }
                output
            }
            Err(panic) => {
                let message = panic_message(&panic);
                tracing::error!(tool = self.tool_name(), message, "tool body panicked");
                TaskOutput::failure(message)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool body panicked".to_string()
    }
}

/// Invokes a named tool on behalf of the server locale.
#[async_trait]
pub trait ServerToolExecutor: Send + Sync {
    async fn execute(&self, tool: &str, inputs: HashMap<String, Value>) -> Option<TaskOutput>;
}

/// Invokes a named tool on behalf of the client locale (desktop mode only -
/// remote mode never calls this, it goes through the transport adapter).
#[async_trait]
pub trait ClientToolExecutor: Send + Sync {
    async fn execute(&self, tool: &str, inputs: HashMap<String, Value>) -> Option<TaskOutput>;
}

/// A locale-agnostic executor backed by a flat table of [`ToolHandle`]s,
/// suitable as either a [`ServerToolExecutor`] or [`ClientToolExecutor`].
/// Applications that want server/client tool isolation can instead supply
/// two separate instances built from disjoint tables.
pub struct ToolTable {
    tools: HashMap<String, ToolHandle>,
}

impl ToolTable {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, handle: ToolHandle) {
        self.tools.insert(handle.tool_name().to_string(), handle);
    }

    /// Populates every registered tool's schema from `registry`. Call once
    /// after the registry has loaded and all tools are registered, so
    /// `ToolHandle::execute`'s own validation is never silently a no-op.
    pub fn sync_schemas(&self, registry: &ToolRegistry) {
        for (name, handle) in &self.tools {
            handle.set_schemas(registry.get(name));
        }
    }

    async fn dispatch(&self, tool: &str, inputs: HashMap<String, Value>) -> Option<TaskOutput> {
        let handle = self.tools.get(tool)?;
        Some(handle.execute(inputs).await)
    }
}

impl Default for ToolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerToolExecutor for ToolTable {
    async fn execute(&self, tool: &str, inputs: HashMap<String, Value>) -> Option<TaskOutput> {
        self.dispatch(tool, inputs).await
    }
}

#[async_trait]
impl ClientToolExecutor for ToolTable {
    async fn execute(&self, tool: &str, inputs: HashMap<String, Value>) -> Option<TaskOutput> {
        self.dispatch(tool, inputs).await
    }
}
