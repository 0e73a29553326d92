//! Configuration types.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Default number of worker loops.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default capacity of the task event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Task engine configuration.
#[derive(Debug, Clone)]
pub struct TaskerConfig {
    /// Number of concurrent worker loops (at least 1).
    pub worker_count: usize,
    /// Location of the JSON snapshot of the task table.
    pub storage_path: PathBuf,
    /// Buffered events per subscriber before it starts lagging.
    pub event_capacity: usize,
}

impl Default for TaskerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            storage_path: storage_path_in("./data"),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl TaskerConfig {
    /// Configuration with the snapshot stored under `save_dir/tasks/tasks.json`.
    pub fn with_save_dir(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path_in(save_dir),
            ..Default::default()
        }
    }

    /// Set the worker count.
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// `KB_TASKER_STORAGE_PATH` wins over `KB_TASKER_SAVE_DIR` when both are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("KB_TASKER_SAVE_DIR") {
            Ok(dir) if !dir.trim().is_empty() => Self::with_save_dir(dir),
            _ => Self::default(),
        };

        if let Ok(path) = std::env::var("KB_TASKER_STORAGE_PATH")
            && !path.trim().is_empty()
        {
            config.storage_path = PathBuf::from(path);
        }

        if let Some(workers) = parse_env::<usize>("KB_TASKER_WORKERS")? {
            config.worker_count = workers.max(1);
        }

        if let Some(capacity) = parse_env::<usize>("KB_TASKER_EVENT_CAPACITY")? {
            if capacity == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "KB_TASKER_EVENT_CAPACITY".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
            config.event_capacity = capacity;
        }

        Ok(config)
    }
}

fn storage_path_in(save_dir: impl Into<PathBuf>) -> PathBuf {
    save_dir.into().join("tasks").join("tasks.json")
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TaskerConfig::default();
        assert_eq!(config.worker_count, 2);
        assert_eq!(
            config.storage_path,
            PathBuf::from("./data").join("tasks").join("tasks.json")
        );
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn save_dir_layout() {
        let config = TaskerConfig::with_save_dir("/var/lib/kb");
        assert_eq!(config.storage_path, PathBuf::from("/var/lib/kb/tasks/tasks.json"));
    }

    #[test]
    fn workers_clamped_to_one() {
        let config = TaskerConfig::default().with_workers(0);
        assert_eq!(config.worker_count, 1);
    }
}
