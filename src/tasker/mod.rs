//! Background task engine.
//!
//! Core components:
//! - `task` — Task record and status machine (Pending → Running → Success/Failed/Cancelled)
//! - `handle` — TaskHandle, the capability a running body uses to report progress
//! - `body` — TaskBody, the contract for a unit of work
//! - `table` — in-memory task table and cleanup selection
//! - `snapshot` — atomic JSON snapshot of the table on disk
//! - `engine` — Tasker: queue, worker pool, query/control operations, recovery

pub mod body;
pub mod engine;
pub mod handle;
pub mod snapshot;
pub mod table;
pub mod task;

pub use body::TaskBody;
pub use engine::{TaskEvent, Tasker};
pub use handle::{TaskCancelled, TaskHandle};
pub use snapshot::{Snapshot, SnapshotStore};
pub use table::CleanupCriteria;
pub use task::{Task, TaskId, TaskStatus, UnknownStatus};
