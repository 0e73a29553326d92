//! Task body contract.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;

use super::handle::TaskHandle;

/// A unit of background work.
///
/// The engine knows nothing about what a body does. It hands the body a
/// [`TaskHandle`], awaits it, and maps the outcome onto the task record:
/// `Ok` is success, an error wrapping [`TaskCancelled`](super::TaskCancelled)
/// is cancellation, anything else is failure.
///
/// Any `FnOnce(TaskHandle) -> impl Future<Output = anyhow::Result<T>>` with a
/// serializable `T` is a body:
///
/// ```ignore
/// tasker.enqueue("Re-index", "reindex", json!({}), |handle: TaskHandle| async move {
///     handle.report_progress(50.0, Some("halfway")).await;
///     handle.checkpoint()?;
///     anyhow::Ok(json!({ "indexed": 10 }))
/// }).await?;
/// ```
#[async_trait]
pub trait TaskBody: Send + 'static {
    /// Run to completion. The returned value becomes the task result unless
    /// the body already set one through the handle.
    async fn run(self: Box<Self>, handle: TaskHandle) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
impl<F, Fut, T> TaskBody for F
where
    F: FnOnce(TaskHandle) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    async fn run(self: Box<Self>, handle: TaskHandle) -> anyhow::Result<serde_json::Value> {
        let output = (*self)(handle).await?;
        Ok(serde_json::to_value(output)?)
    }
}
