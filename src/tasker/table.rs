//! In-memory task table.
//!
//! The engine keeps exactly one of these behind a single mutex; nothing in
//! here locks on its own.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{Task, TaskId, TaskStatus};

/// Criteria for bulk cleanup. Every supplied criterion must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupCriteria {
    /// Only tasks with this status.
    pub status: Option<TaskStatus>,
    /// Only tasks created strictly before this instant.
    pub older_than: Option<DateTime<Utc>>,
    /// Protect the N most recently created tasks of every status.
    pub keep_count: Option<usize>,
}

impl CleanupCriteria {
    fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status
            && task.status != status
        {
            return false;
        }
        if let Some(cutoff) = self.older_than
            && task.created_at >= cutoff
        {
            return false;
        }
        true
    }
}

/// A task plus the lock-free mirror of its cancellation flag.
#[derive(Debug)]
pub(crate) struct TaskEntry {
    pub(crate) task: Task,
    cancel: Arc<AtomicBool>,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        let cancel = Arc::new(AtomicBool::new(task.cancel_requested));
        Self { task, cancel }
    }

    /// Request cancellation on both the record and the shared flag.
    pub(crate) fn request_cancel(&mut self) -> bool {
        let accepted = self.task.request_cancel();
        if accepted {
            self.cancel.store(true, Ordering::Release);
        }
        accepted
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

/// Mapping from task id to task, plus whether the snapshot was loaded yet.
#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    entries: HashMap<TaskId, TaskEntry>,
    pub(crate) recovered: bool,
}

impl TaskTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, task: Task) {
        self.entries.insert(task.id.clone(), TaskEntry::new(task));
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Task> {
        self.entries.get(id).map(|entry| &entry.task)
    }

    pub(crate) fn entry_mut(&mut self, id: &str) -> Option<&mut TaskEntry> {
        self.entries.get_mut(id)
    }

    /// Remove a task. A task that is still in flight gets its cancellation
    /// flag raised first so a cooperative body can notice and stop.
    pub(crate) fn remove(&mut self, id: &str) -> Option<Task> {
        let entry = self.entries.get_mut(id)?;
        if entry.task.status.is_active() {
            entry.request_cancel();
        }
        self.entries.remove(id).map(|entry| entry.task)
    }

    /// Tasks newest first, optionally filtered by status.
    pub(crate) fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .entries
            .values()
            .filter(|entry| status.is_none_or(|s| entry.task.status == s))
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Every record, oldest first, for the snapshot file.
    pub(crate) fn records(&self) -> Vec<Task> {
        self.records_without(&HashSet::new())
    }

    /// Snapshot records as they will be once `excluded` is removed.
    pub(crate) fn records_without(&self, excluded: &HashSet<TaskId>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .entries
            .values()
            .filter(|e| !excluded.contains(&e.task.id))
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Load records from a snapshot, reclassifying anything still in flight
    /// as failed. Records already present in the table are kept as they are.
    /// Returns the number of reclassified records.
    pub(crate) fn restore(&mut self, records: Vec<Task>) -> usize {
        let mut interrupted = 0;
        for mut task in records {
            if self.entries.contains_key(&task.id) {
                continue;
            }
            if task.mark_interrupted() {
                interrupted += 1;
            }
            self.insert(task);
        }
        interrupted
    }

    /// Ids selected for deletion by `criteria`.
    pub(crate) fn cleanup_candidates(&self, criteria: &CleanupCriteria) -> Vec<TaskId> {
        let mut candidates: Vec<&Task> = self
            .entries
            .values()
            .map(|entry| &entry.task)
            .filter(|task| criteria.matches(task))
            .collect();

        if let Some(keep) = criteria.keep_count {
            let mut by_status: HashMap<TaskStatus, Vec<&Task>> = HashMap::new();
            for entry in self.entries.values() {
                by_status.entry(entry.task.status).or_default().push(&entry.task);
            }

            let mut protected: HashSet<&TaskId> = HashSet::new();
            for (status, mut tasks) in by_status {
                tasks.sort_by(|a, b| {
                    b.created_at
                        .cmp(&a.created_at)
                        .then_with(|| a.id.cmp(&b.id))
                });
                tracing::debug!(
                    status = %status,
                    kept = tasks.len().min(keep),
                    "Protecting most recent tasks from cleanup"
                );
                protected.extend(tasks.into_iter().take(keep).map(|task| &task.id));
            }

            candidates.retain(|task| !protected.contains(&task.id));
        }

        candidates.into_iter().map(|task| task.id.clone()).collect()
    }
}
