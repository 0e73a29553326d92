//! The task engine: queue, worker pool, query/control operations.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::body::TaskBody;
use super::handle::{TaskCancelled, TaskHandle};
use super::snapshot::SnapshotStore;
use super::table::{CleanupCriteria, TaskTable};
use super::task::{Task, TaskId, TaskStatus};
use crate::config::TaskerConfig;
use crate::error::{Error, Result, TaskError};

const MSG_STARTED: &str = "Task started";
const MSG_COMPLETED: &str = "Task completed";
const MSG_FAILED: &str = "Task failed";
const MSG_CANCELLED: &str = "Task was cancelled";
const MSG_CANCELLED_BEFORE: &str = "Task was cancelled before execution";
const MSG_CANCELLED_DURING: &str = "Task cancelled during execution";

/// Change notification for subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task was created or one of its fields changed.
    Updated { task: Task },
    /// A task record was removed.
    Deleted { id: TaskId },
}

type QueueItem = (TaskId, Box<dyn TaskBody>);

/// State shared between the engine, its workers, and every task handle.
pub(crate) struct Shared {
    table: Mutex<TaskTable>,
    store: SnapshotStore,
    events: broadcast::Sender<TaskEvent>,
}

impl Shared {
    /// Lock the table, loading the snapshot first if nobody has yet.
    ///
    /// Loading before the first access means an early `enqueue` can never
    /// overwrite the history left by a previous run.
    async fn lock(&self) -> MutexGuard<'_, TaskTable> {
        let mut table = self.table.lock().await;
        if !table.recovered {
            self.recover_locked(&mut table).await;
        }
        table
    }

    /// Returns the number of in-flight records that were reclassified.
    async fn recover_locked(&self, table: &mut TaskTable) -> usize {
        table.recovered = true;
        match self.store.load().await {
            Ok(Some(snapshot)) => {
                let total = snapshot.tasks.len();
                let interrupted = table.restore(snapshot.tasks);
                info!(
                    total,
                    interrupted,
                    path = %self.store.path().display(),
                    "Loaded task records from snapshot"
                );
                interrupted
            }
            Ok(None) => 0,
            Err(e) => {
                error!(error = %e, "Failed to load task snapshot, starting empty");
                0
            }
        }
    }

    async fn persist_locked(&self, table: &TaskTable) -> Result<()> {
        self.persist(table.records()).await
    }

    /// Write the table minus `ids`, then drop them from memory.
    ///
    /// Nothing is removed or announced unless the write succeeds.
    async fn remove_persisted(
        &self,
        table: &mut TaskTable,
        ids: &HashSet<TaskId>,
    ) -> Result<Vec<Task>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.persist(table.records_without(ids)).await?;

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = table.remove(id.as_str()) {
                self.emit(TaskEvent::Deleted { id: task.id.clone() });
                removed.push(task);
            }
        }
        Ok(removed)
    }

    async fn persist(&self, records: Vec<Task>) -> Result<()> {
        self.store.save(records).await.map_err(|e| {
            error!(
                error = %e,
                path = %self.store.path().display(),
                "Failed to persist task snapshot"
            );
            Error::from(e)
        })
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Mutate one task under the table lock.
    ///
    /// `f` returns whether it changed anything; unchanged tasks are neither
    /// persisted nor announced. Returns the task as it is after `f`, or `None`
    /// for unknown ids.
    pub(crate) async fn update<F>(&self, id: &str, f: F) -> Result<Option<Task>>
    where
        F: FnOnce(&mut Task) -> bool,
    {
        let mut table = self.lock().await;
        let Some(entry) = table.entry_mut(id) else {
            return Ok(None);
        };
        if !f(&mut entry.task) {
            return Ok(Some(entry.task.clone()));
        }
        let task = entry.task.clone();
        self.emit(TaskEvent::Updated { task: task.clone() });
        self.persist_locked(&table).await?;
        Ok(Some(task))
    }

    async fn get(&self, id: &str) -> Option<Task> {
        self.lock().await.get(id).cloned()
    }

    async fn cancel_flag(&self, id: &str) -> Option<Arc<AtomicBool>> {
        self.lock()
            .await
            .entry_mut(id)
            .map(|entry| entry.cancel_flag())
    }

    /// Like [`Shared::update`] for worker-side transitions: a persistence
    /// failure is logged and the in-memory record is used anyway, since the
    /// table stays the source of truth while the process is alive.
    async fn transition<F>(&self, id: &TaskId, f: F) -> Option<Task>
    where
        F: FnOnce(&mut Task) -> bool,
    {
        match self.update(id.as_str(), f).await {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %id, error = %e, "Task transition was not persisted");
                self.get(id.as_str()).await
            }
        }
    }

    /// Drive one dequeued task to a terminal status.
    async fn dispatch(self: &Arc<Self>, id: TaskId, body: Box<dyn TaskBody>) {
        let Some(task) = self
            .transition(&id, |task| {
                if task.cancel_requested {
                    task.finish(TaskStatus::Cancelled, MSG_CANCELLED_BEFORE, None)
                        .is_ok()
                } else {
                    task.start(MSG_STARTED).is_ok()
                }
            })
            .await
        else {
            debug!(task_id = %id, "Task was deleted before dispatch, skipping");
            return;
        };

        match task.status {
            TaskStatus::Running => {}
            TaskStatus::Cancelled => {
                info!(task_id = %id, "Task cancelled before execution");
                return;
            }
            status => {
                warn!(task_id = %id, status = %status, "Dequeued task is not runnable, skipping");
                return;
            }
        }

        // A record deleted in the meantime had its flag raised on the way out.
        let cancel = self
            .cancel_flag(id.as_str())
            .await
            .unwrap_or_else(|| Arc::new(AtomicBool::new(true)));
        let handle = TaskHandle::new(id.clone(), cancel, Arc::clone(self));

        debug!(task_id = %id, name = %task.name, "Running task body");
        let outcome = match AssertUnwindSafe(body.run(handle)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.downcast_ref::<TaskCancelled>().is_some() => Err(TaskError::Cancelled),
            Ok(Err(e)) => Err(TaskError::Failed(format!("{e:#}"))),
            Err(panic) => Err(TaskError::Panicked(panic_message(&*panic))),
        };

        let finished = self
            .transition(&id, |task| {
                let finished = match &outcome {
                    Ok(_) if task.cancel_requested => {
                        task.finish(TaskStatus::Cancelled, MSG_CANCELLED_DURING, None)
                    }
                    Ok(value) => {
                        if task.result.is_none() && !value.is_null() {
                            task.set_result(value.clone());
                        }
                        task.finish(TaskStatus::Success, MSG_COMPLETED, None)
                    }
                    Err(TaskError::Cancelled) => {
                        task.finish(TaskStatus::Cancelled, MSG_CANCELLED, None)
                    }
                    Err(e) => task.finish(TaskStatus::Failed, MSG_FAILED, Some(e.to_string())),
                };
                finished.is_ok()
            })
            .await;

        match (finished, outcome) {
            (None, _) => {
                info!(task_id = %id, "Task finished after its record was deleted");
            }
            (Some(task), Err(e)) if task.status == TaskStatus::Failed => {
                error!(task_id = %id, name = %task.name, error = %e, "Task failed");
            }
            (Some(task), _) => {
                info!(task_id = %id, status = %task.status, "Task finished");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<Shared>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<QueueItem>>>,
) {
    debug!(worker, "Task worker started");
    loop {
        let next = queue.lock().await.recv().await;
        let Some((id, body)) = next else {
            break;
        };
        shared.dispatch(id, body).await;
    }
    debug!(worker, "Task worker stopped");
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    workers: Vec<JoinHandle<()>>,
}

/// Durable in-process background task engine.
///
/// Construct one at the application's composition root, wrap it in an
/// `Arc`, call [`Tasker::start`], and pass it to whatever needs to enqueue
/// work. Work enqueued before `start` waits in the queue.
///
/// Cancellation is cooperative. A body that never calls
/// [`TaskHandle::checkpoint`] runs until it returns, even after its record
/// was deleted.
pub struct Tasker {
    worker_count: usize,
    shared: Arc<Shared>,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<QueueItem>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Tasker {
    /// Create an engine. Nothing touches the disk until first use.
    pub fn new(config: TaskerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            worker_count: config.worker_count.max(1),
            shared: Arc::new(Shared {
                table: Mutex::new(TaskTable::new()),
                store: SnapshotStore::new(config.storage_path),
                events,
            }),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub async fn is_started(&self) -> bool {
        self.lifecycle.lock().await.started
    }

    /// Subscribe to task changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    /// Recover the snapshot and spawn the worker pool. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return Ok(());
        }

        {
            let mut table = self.shared.table.lock().await;
            if !table.recovered && self.shared.recover_locked(&mut table).await > 0 {
                self.shared.persist_locked(&table).await?;
            }
        }

        for worker in 0..self.worker_count {
            lifecycle.workers.push(tokio::spawn(worker_loop(
                worker,
                Arc::clone(&self.shared),
                Arc::clone(&self.queue_rx),
            )));
        }
        lifecycle.started = true;
        info!(workers = self.worker_count, "Tasker started");
        Ok(())
    }

    /// Stop the worker pool and write a final snapshot. Idempotent.
    ///
    /// Bodies still running are dropped at their next suspension point;
    /// their records keep whatever status they had.
    pub async fn shutdown(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.started {
            return Ok(());
        }

        let workers = std::mem::take(&mut lifecycle.workers);
        for worker in &workers {
            worker.abort();
        }
        join_all(workers).await;
        lifecycle.started = false;

        let table = self.shared.lock().await;
        self.shared.persist_locked(&table).await?;
        info!(tasks = table.len(), "Tasker shutdown complete");
        Ok(())
    }

    /// Create a pending task and queue its body. Returns without waiting for
    /// execution.
    pub async fn enqueue<P, B>(
        &self,
        name: impl Into<String>,
        task_type: impl Into<String>,
        payload: P,
        body: B,
    ) -> Result<Task>
    where
        P: Serialize,
        B: TaskBody,
    {
        let payload = serde_json::to_value(payload).map_err(Error::Payload)?;
        let task = Task::new(name, task_type, payload);
        let body: Box<dyn TaskBody> = Box::new(body);

        {
            let mut table = self.shared.lock().await;
            table.insert(task.clone());
            if let Err(e) = self.shared.persist_locked(&table).await {
                table.remove(task.id.as_str());
                return Err(e);
            }
            self.shared.emit(TaskEvent::Updated { task: task.clone() });
            // The receiver lives as long as `self`, so this cannot fail.
            let _ = self.queue_tx.send((task.id.clone(), body));
        }

        info!(task_id = %task.id, name = %task.name, task_type = %task.task_type, "Enqueued task");
        Ok(task)
    }

    /// All tasks, newest first, optionally filtered by status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.shared.lock().await.list(status)
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.shared.get(id).await
    }

    /// Request cooperative cancellation. `false` for unknown or finished tasks.
    pub async fn cancel_task(&self, id: &str) -> Result<bool> {
        let mut table = self.shared.lock().await;
        let Some(entry) = table.entry_mut(id) else {
            warn!(task_id = %id, "Cannot cancel unknown task");
            return Ok(false);
        };
        if !entry.request_cancel() {
            debug!(task_id = %id, status = %entry.task.status, "Cannot cancel finished task");
            return Ok(false);
        }
        let task = entry.task.clone();
        self.shared.emit(TaskEvent::Updated { task });
        self.shared.persist_locked(&table).await?;
        info!(task_id = %id, "Cancellation requested");
        Ok(true)
    }

    /// Remove a task record. A task still in flight gets cancellation
    /// requested first, but the record goes away immediately either way.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let mut table = self.shared.lock().await;
        let Some(task) = table.get(id) else {
            warn!(task_id = %id, "Task not found for deletion");
            return Ok(false);
        };
        let ids = HashSet::from([task.id.clone()]);
        for task in self.shared.remove_persisted(&mut table, &ids).await? {
            if task.status.is_active() {
                info!(
                    task_id = %id,
                    status = %task.status,
                    "Deleted in-flight task, cancellation requested"
                );
            }
            info!(task_id = %id, name = %task.name, "Task deleted");
        }
        Ok(true)
    }

    /// Delete several tasks. Each id is handled on its own; unknown ids map
    /// to `false` without affecting the rest.
    pub async fn delete_tasks_batch<I, S>(&self, ids: I) -> Result<HashMap<TaskId, bool>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = self.shared.lock().await;
        let mut results = HashMap::new();
        let mut found = HashSet::new();
        let mut failed = Vec::new();

        for id in ids {
            let id = TaskId::from(id.as_ref());
            let exists = table.get(id.as_str()).is_some();
            if exists {
                found.insert(id.clone());
            } else {
                failed.push(id.to_string());
            }
            *results.entry(id).or_insert(false) |= exists;
        }

        let deleted = self.shared.remove_persisted(&mut table, &found).await?.len();

        info!(deleted, failed = failed.len(), "Batch delete completed");
        if !failed.is_empty() {
            warn!(ids = ?failed, "Failed to delete tasks");
        }
        Ok(results)
    }

    /// Delete every task matching all supplied criteria, minus the
    /// `keep_count` newest per status. Returns how many were deleted.
    pub async fn cleanup_tasks(&self, criteria: CleanupCriteria) -> Result<usize> {
        let mut table = self.shared.lock().await;
        let total = table.len();
        let candidates: HashSet<TaskId> =
            table.cleanup_candidates(&criteria).into_iter().collect();

        let removed = self.shared.remove_persisted(&mut table, &candidates).await?;
        for task in &removed {
            debug!(task_id = %task.id, name = %task.name, "Cleaned up task");
        }
        let deleted = removed.len();
        info!(
            deleted,
            total,
            status = ?criteria.status,
            older_than = ?criteria.older_than,
            keep_count = ?criteria.keep_count,
            "Task cleanup completed"
        );
        Ok(deleted)
    }

    /// Wait until a task reaches a terminal status. `None` if the task does
    /// not exist or is deleted while waiting.
    pub async fn wait_for(&self, id: &str) -> Option<Task> {
        let mut events = self.subscribe();
        loop {
            match self.get_task(id).await {
                Some(task) if task.is_terminal() => return Some(task),
                None => return None,
                Some(_) => {}
            }
            loop {
                match events.recv().await {
                    Ok(TaskEvent::Updated { task }) if task.id.as_str() == id => {
                        if task.is_terminal() {
                            return Some(task);
                        }
                    }
                    Ok(TaskEvent::Deleted { id: deleted }) if deleted.as_str() == id => {
                        return None;
                    }
                    Ok(_) => {}
                    // Missed events; look at the table again.
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return self.get_task(id).await,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn tasker_in(dir: &TempDir, workers: usize) -> Tasker {
        Tasker::new(TaskerConfig::with_save_dir(dir.path()).with_workers(workers))
    }

    #[tokio::test]
    async fn enqueue_persists_pending_task() {
        let dir = TempDir::new().unwrap();
        let tasker = tasker_in(&dir, 1);

        let task = tasker
            .enqueue("Ingest", "ingest", json!({ "file": "a.pdf" }), |_h: TaskHandle| async {
                anyhow::Ok(())
            })
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let snapshot = tasker.shared.store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.tasks[0].id, task.id);
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let tasker = tasker_in(&dir, 2);
        tasker.start().await.unwrap();
        tasker.start().await.unwrap();
        assert!(tasker.is_started().await);
        assert_eq!(tasker.lifecycle.lock().await.workers.len(), 2);

        tasker.shutdown().await.unwrap();
        tasker.shutdown().await.unwrap();
        assert!(!tasker.is_started().await);
        assert!(tasker.shared.store.path().exists());
    }

    #[tokio::test]
    async fn body_result_set_through_handle_wins() {
        let dir = TempDir::new().unwrap();
        let tasker = tasker_in(&dir, 1);
        tasker.start().await.unwrap();

        let task = tasker
            .enqueue("t", "general", (), |h: TaskHandle| async move {
                h.set_result(json!("from handle")).await;
                anyhow::Ok(json!("from return"))
            })
            .await
            .unwrap();
        let done = tasker.wait_for(task.id.as_str()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.result, Some(json!("from handle")));
        tasker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unit_return_leaves_result_unset() {
        let dir = TempDir::new().unwrap();
        let tasker = tasker_in(&dir, 1);
        tasker.start().await.unwrap();

        let task = tasker
            .enqueue("t", "general", (), |_h: TaskHandle| async { anyhow::Ok(()) })
            .await
            .unwrap();
        let done = tasker.wait_for(task.id.as_str()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.progress, 100.0);
        assert!(done.result.is_none());
        assert_eq!(done.message, MSG_COMPLETED);
        tasker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_body_is_recorded_as_failed() {
        let dir = TempDir::new().unwrap();
        let tasker = tasker_in(&dir, 1);
        tasker.start().await.unwrap();

        let task = tasker
            .enqueue("t", "general", (), |_h: TaskHandle| async {
                if true {
                    panic!("parser exploded");
                }
                anyhow::Ok(())
            })
            .await
            .unwrap();
        let done = tasker.wait_for(task.id.as_str()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.unwrap().contains("parser exploded"));

        // the worker survives and keeps processing
        let next = tasker
            .enqueue("t2", "general", (), |_h: TaskHandle| async { anyhow::Ok(7) })
            .await
            .unwrap();
        let done = tasker.wait_for(next.id.as_str()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.result, Some(json!(7)));
        tasker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn checkpoint_cancels_running_task() {
        let dir = TempDir::new().unwrap();
        let tasker = Arc::new(tasker_in(&dir, 1));
        tasker.start().await.unwrap();

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let task = tasker
            .enqueue("long", "general", (), move |h: TaskHandle| async move {
                let _ = started_tx.send(());
                while !h.is_cancel_requested() {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                h.checkpoint()?;
                anyhow::Ok(())
            })
            .await
            .unwrap();

        started_rx.await.unwrap();
        assert!(tasker.cancel_task(task.id.as_str()).await.unwrap());

        let done = tasker.wait_for(task.id.as_str()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);
        assert_eq!(done.progress, 100.0);
        assert!(done.cancel_requested);
        assert!(done.completed_at.is_some());
        assert!(!tasker.cancel_task(task.id.as_str()).await.unwrap());
        tasker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn normal_return_after_cancel_request_is_cancelled() {
        let dir = TempDir::new().unwrap();
        let tasker = Arc::new(tasker_in(&dir, 1));
        tasker.start().await.unwrap();

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tasker
            .enqueue("t", "general", (), move |_h: TaskHandle| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                anyhow::Ok(json!("ignored"))
            })
            .await
            .unwrap();

        started_rx.await.unwrap();
        assert!(tasker.cancel_task(task.id.as_str()).await.unwrap());
        release_tx.send(()).unwrap();

        let done = tasker.wait_for(task.id.as_str()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);
        assert_eq!(done.message, MSG_CANCELLED_DURING);
        tasker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_unknown_task_is_none() {
        let dir = TempDir::new().unwrap();
        let tasker = tasker_in(&dir, 1);
        assert!(tasker.wait_for("nope").await.is_none());
    }

    #[tokio::test]
    async fn events_announce_updates_and_deletes() {
        let dir = TempDir::new().unwrap();
        let tasker = tasker_in(&dir, 1);
        let mut events = tasker.subscribe();

        let task = tasker
            .enqueue("t", "general", (), |_h: TaskHandle| async { anyhow::Ok(()) })
            .await
            .unwrap();
        assert!(tasker.delete_task(task.id.as_str()).await.unwrap());

        match events.recv().await.unwrap() {
            TaskEvent::Updated { task: created } => assert_eq!(created.id, task.id),
            other => panic!("expected Updated, got {other:?}"),
        }
        match events.recv().await.unwrap() {
            TaskEvent::Deleted { id } => assert_eq!(id, task.id),
            other => panic!("expected Deleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persistence_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, "not a directory").await.unwrap();
        let tasker = Tasker::new(TaskerConfig {
            storage_path: blocker.join("tasks.json"),
            ..TaskerConfig::default()
        });

        let result = tasker
            .enqueue("t", "general", (), |_h: TaskHandle| async { anyhow::Ok(()) })
            .await;
        assert!(matches!(result, Err(Error::Snapshot(_))));
    }

    #[tokio::test]
    async fn failed_enqueue_never_queues_body() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, "not a directory").await.unwrap();
        let tasker = Tasker::new(TaskerConfig {
            storage_path: blocker.join("tasks.json"),
            ..TaskerConfig::default()
        });
        let mut events = tasker.subscribe();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let result = tasker
            .enqueue("t", "general", (), move |_h: TaskHandle| async move {
                flag.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Snapshot(_))));

        assert!(tasker.list_tasks(None).await.is_empty());
        assert!(tasker.queue_rx.lock().await.try_recv().is_err());
        assert!(events.try_recv().is_err());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_delete_write_keeps_tasks() {
        let dir = TempDir::new().unwrap();
        let tasker = tasker_in(&dir, 1);
        let task = tasker
            .enqueue("t", "general", (), |_h: TaskHandle| async { anyhow::Ok(()) })
            .await
            .unwrap();
        let mut events = tasker.subscribe();

        // Turn the snapshot directory into a plain file so every write fails.
        let snapshot_dir = tasker.shared.store.path().parent().unwrap().to_path_buf();
        tokio::fs::remove_dir_all(&snapshot_dir).await.unwrap();
        tokio::fs::write(&snapshot_dir, "blocked").await.unwrap();

        let id = task.id.as_str();
        assert!(matches!(
            tasker.delete_tasks_batch([id, "missing"]).await,
            Err(Error::Snapshot(_))
        ));
        assert!(matches!(tasker.delete_task(id).await, Err(Error::Snapshot(_))));
        assert!(matches!(
            tasker.cleanup_tasks(CleanupCriteria::default()).await,
            Err(Error::Snapshot(_))
        ));

        let remaining = tasker.get_task(id).await.unwrap();
        assert_eq!(remaining.status, TaskStatus::Pending);
        assert!(!remaining.cancel_requested);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn panic_message_extracts_text() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*boxed), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(&*boxed), "unknown panic payload");
    }
}
