//! kb-tasker — durable in-process background task engine.

pub mod config;
pub mod error;
pub mod tasker;

pub use config::TaskerConfig;
pub use error::{Error, Result};
pub use tasker::{
    CleanupCriteria, Task, TaskBody, TaskCancelled, TaskEvent, TaskHandle, TaskId, TaskStatus,
    Tasker,
};
