//! Dead-letter record: terminal failure snapshot of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeadLetterId, Task, TaskId, TaskKind};

/// Snapshot taken when a task exhausts its retries or has no handler.
///
/// The originating task stays `Failed`; re-running the work means
/// re-enqueueing from this snapshot by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub task_id: TaskId,
    pub queue: String,
    pub kind: TaskKind,
    pub task_name: String,
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
    pub priority: u8,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_task(id: DeadLetterId, task: &Task, error: String, failed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            task_id: task.id,
            queue: task.queue.clone(),
            kind: task.kind,
            task_name: task.task_name.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
            error,
            retry_count: task.retry_count,
            failed_at,
        }
    }
}
