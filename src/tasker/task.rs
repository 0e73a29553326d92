//! Task record and its state machine.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Allocate a fresh random id (32 lowercase hex chars).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    #[default]
    Pending,
    /// A worker is executing the body.
    Running,
    /// Body returned normally.
    Success,
    /// Body failed, or the task was orphaned by a restart.
    Failed,
    /// Cancellation was observed before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Success) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Check if the task is still in flight.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

fn default_name() -> String {
    "Unnamed Task".to_string()
}

fn default_type() -> String {
    "general".to_string()
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Clamp a reported progress value into `[0, 100]`. NaN reads as 0.
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Durable record of one unit of background work.
///
/// Snapshot records may omit anything but `id`; missing fields fall back to
/// the same defaults a freshly created task gets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(rename = "type", default = "default_type")]
    pub task_type: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Task {
    /// Create a pending task. A `null` payload is stored as an empty object.
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::with_id(TaskId::generate(), name, task_type, payload)
    }

    /// Create a pending task with a caller-chosen id.
    pub fn with_id(
        id: TaskId,
        name: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            message: String::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            payload: if payload.is_null() {
                empty_payload()
            } else {
                payload
            },
            result: None,
            error: None,
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Decode the payload into a caller-owned type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Decode the result into a caller-owned type, if one was recorded.
    pub fn result_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.result.as_ref().map(T::deserialize)
    }

    /// Refresh `updated_at`, never moving it backwards.
    fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }

    /// Move to a new status, stamping `started_at` / `completed_at` the first
    /// time the task enters `running` / a terminal status.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.status, target
            ));
        }
        self.enter(target);
        Ok(())
    }

    fn enter(&mut self, target: TaskStatus) {
        self.status = target;
        let now = Utc::now();
        if target == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if target.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.touch();
    }

    /// Worker-side start: `running`, progress reset, message set.
    pub fn start(&mut self, message: impl Into<String>) -> Result<(), String> {
        self.transition_to(TaskStatus::Running)?;
        self.progress = 0.0;
        self.message = message.into();
        Ok(())
    }

    /// Worker-side completion into a terminal status. Progress is pinned to 100.
    pub fn finish(
        &mut self,
        status: TaskStatus,
        message: impl Into<String>,
        error: Option<String>,
    ) -> Result<(), String> {
        if !status.is_terminal() {
            return Err(format!("{status} is not a terminal status"));
        }
        self.transition_to(status)?;
        self.progress = 100.0;
        self.message = message.into();
        if status == TaskStatus::Failed {
            self.error = error;
        }
        Ok(())
    }

    /// Reclassify an in-flight record found at startup as `failed`.
    /// Returns `false` for records that were already terminal.
    ///
    /// This is the only way a pending task becomes `failed`.
    pub fn mark_interrupted(&mut self) -> bool {
        let message = match self.status {
            TaskStatus::Running => "Task interrupted by service restart",
            TaskStatus::Pending => "Task was not resumed after service restart",
            _ => return false,
        };
        self.enter(TaskStatus::Failed);
        self.message = message.to_string();
        self.error = Some(message.to_string());
        true
    }

    /// Report progress, optionally with a new message. No-op once terminal.
    pub fn set_progress(&mut self, value: f64, message: Option<&str>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.progress = clamp_progress(value);
        if let Some(message) = message {
            self.message = message.to_string();
        }
        self.touch();
        true
    }

    /// Overwrite the status line. No-op once terminal.
    pub fn set_message(&mut self, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.message = message.into();
        self.touch();
        true
    }

    /// Attach the body's output. No-op once terminal.
    pub fn set_result(&mut self, result: serde_json::Value) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.result = Some(result);
        self.touch();
        true
    }

    /// Raise the cancellation flag. Refused once terminal; the flag never
    /// goes back to `false`.
    pub fn request_cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if !self.cancel_requested {
            self.cancel_requested = true;
            self.touch();
        }
        true
    }
}
