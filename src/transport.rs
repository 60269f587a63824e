//! Client transport adapter (SPEC_FULL.md §4.4, §6.4): the remote-mode
//! collaborator the engine hands emitted tasks to, and through which acks
//! flow back into the orchestrator.

use async_trait::async_trait;

use crate::model::TaskRecord;

/// Dispatches emitted client tasks to a remote client over whatever
/// transport the embedding application uses (sockets, IPC, push). The core
/// never constructs or owns a transport; it only calls through this trait.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Sends a single task. Returns `false` if dispatch itself failed (the
    /// task never reached the client) - the engine marks the task failed
    /// with a `TransportError` in that case. A `true` return means the
    /// client accepted the task; its eventual ack (or lack of one) is
    /// outside the transport's or the core's ability to detect here.
    async fn emit_task_single(&self, user_id: &str, task: &TaskRecord) -> bool;

    /// Sends a contiguous client chain as one batch. The default
    /// implementation falls back to sequential `emit_task_single` calls,
    /// succeeding only if every task in the chain was accepted.
    async fn emit_task_batch(&self, user_id: &str, tasks: &[TaskRecord]) -> bool {
        for task in tasks {
            if !self.emit_task_single(user_id, task).await {
                return false;
            }
        }
        true
    }
}
