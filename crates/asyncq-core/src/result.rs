use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::status::TaskState;

/// Key prefix every result record is stored under.
pub const RESULT_KEY_PREFIX: &str = "celery-task-meta-";

/// A task's state as recorded in the result store.
///
/// The serialized shape follows the Celery result backend contract, so
/// records written here are readable by existing clients and vice versa.
/// A missing record reads as the PENDING sentinel from [`ResultMeta::pending`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMeta {
    pub status: TaskState,
    pub result: Value,
    #[serde(default)]
    pub traceback: Option<Value>,
    #[serde(default)]
    pub children: Vec<Value>,
    #[serde(default)]
    pub date_done: Option<DateTime<Utc>>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

impl ResultMeta {
    /// Storage key for a task's record.
    pub fn key_for(task_id: Uuid) -> String {
        format!("{RESULT_KEY_PREFIX}{task_id}")
    }

    /// Sentinel returned when no record exists yet. Never written to the
    /// store; absence itself means PENDING.
    pub fn pending() -> Self {
        Self {
            status: TaskState::Pending,
            result: Value::Null,
            traceback: None,
            children: Vec::new(),
            date_done: None,
            task_id: None,
        }
    }

    /// A record with `state` and `result`, stamped now.
    pub fn with_state(task_id: Uuid, state: TaskState, result: Value) -> Self {
        Self {
            status: state,
            result,
            traceback: None,
            children: Vec::new(),
            date_done: Some(Utc::now()),
            task_id: Some(task_id),
        }
    }

    pub fn success(task_id: Uuid, result: Value) -> Self {
        Self::with_state(task_id, TaskState::Success, result)
    }

    pub fn failure(task_id: Uuid, error: &str) -> Self {
        Self::with_state(task_id, TaskState::Failure, Value::String(error.to_string()))
    }

    pub fn retry(task_id: Uuid, reason: &str) -> Self {
        Self::with_state(task_id, TaskState::Retry, Value::String(reason.to_string()))
    }

    pub fn revoked(task_id: Uuid) -> Self {
        Self::with_state(task_id, TaskState::Revoked, Value::Null)
    }
}
