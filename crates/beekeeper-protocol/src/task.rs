//! Task and result bundles dispatched to workers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// One invocation of a job: an argument bundle identified by a UUID.
/// The dispatcher assigns the UUID; the worker fills `returns` (or `error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Task {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
    #[serde(default)]
    pub returns: HashMap<String, Value>,
    #[serde(default)]
    pub error: String,
}

impl Task {
    pub fn new() -> Self {
        Task::default()
    }

    /// Serialize for a message payload or the subprocess pipe.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Outcome of a task as reported by a worker. Echoes the task UUID and
/// carries the task with its returns populated, or an error string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskResult {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub task: Task,
    #[serde(default)]
    pub error: String,
}

impl TaskResult {
    /// A result that only reports a failure.
    pub fn from_error(error: impl Into<String>) -> Self {
        TaskResult {
            error: error.into(),
            ..TaskResult::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}
