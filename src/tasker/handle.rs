//! Capability passed to a running task body.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use super::engine::Shared;
use super::task::TaskId;

/// Signal raised by [`TaskHandle::checkpoint`] once cancellation was requested.
///
/// Bodies propagate it with `?`; the worker recognises it and records the
/// task as `cancelled` rather than `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Task was cancelled")]
pub struct TaskCancelled;

/// The only way a task body can touch its own record.
///
/// Every write is best effort: a persistence failure is logged and the body
/// carries on, and writes after the task was deleted or reached a terminal
/// status are ignored.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    cancel: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, cancel: Arc<AtomicBool>, shared: Arc<Shared>) -> Self {
        Self { id, cancel, shared }
    }

    /// Id of the task this handle is bound to.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Report progress (clamped to `[0, 100]`) and optionally a new message.
    pub async fn report_progress(&self, value: f64, message: Option<&str>) {
        self.write("progress", |task| task.set_progress(value, message))
            .await;
    }

    /// Replace the status message.
    pub async fn report_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.write("message", |task| task.set_message(message))
            .await;
    }

    /// Attach a result. Status is left alone; the worker decides it.
    pub async fn set_result<T: Serialize>(&self, value: T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(task_id = %self.id, error = %e, "Task result is not serializable");
                return;
            }
        };
        self.write("result", |task| task.set_result(value)).await;
    }

    /// Non-blocking read of the cancellation flag.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Bail out at a safe point if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), TaskCancelled> {
        if self.is_cancel_requested() {
            Err(TaskCancelled)
        } else {
            Ok(())
        }
    }

    async fn write<F>(&self, what: &str, f: F)
    where
        F: FnOnce(&mut super::task::Task) -> bool,
    {
        if let Err(e) = self.shared.update(self.id.as_str(), f).await {
            tracing::error!(
                task_id = %self.id,
                field = what,
                error = %e,
                "Failed to persist task update"
            );
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("cancel_requested", &self.is_cancel_requested())
            .finish_non_exhaustive()
    }
}
