//! Bus event envelope and well-known event names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JOB_STARTED: &str = "job:started";
pub const JOB_OUTPUT: &str = "job:output";
pub const JOB_COMPLETED: &str = "job:completed";
pub const TASK_STARTED: &str = "task:started";
pub const TASK_PROGRESS: &str = "task:progress";
pub const TASK_COMPLETED: &str = "task:completed";
pub const TASK_FAILED: &str = "task:failed";

/// A single event delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusEvent {
    /// Event name (e.g. `task:progress`).
    pub event: String,
    pub payload: Value,
    /// Unix millis.
    pub timestamp: i64,
}

impl BusEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
