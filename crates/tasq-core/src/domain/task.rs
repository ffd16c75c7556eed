//! Task record: the unit of work and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TaskId;

/// Default priority when the caller does not pick one (mid-scale).
pub const DEFAULT_PRIORITY: u8 = 50;

/// Highest accepted priority.
pub const MAX_PRIORITY: u8 = 100;

/// Default retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configurable retry budgets are clamped to this value.
pub const MAX_RETRIES_CAP: u32 = 10;

/// Queue used when nothing else is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Task lifecycle state.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Pending (retry with backoff, or lease reclaimed)
/// - Pending -> Processing -> Failed (retries exhausted or no handler; dead-lettered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    OneTime,
    Recurring,
}

/// One unit of schedulable work.
///
/// The serialized shape is additive-only: new fields must carry
/// `#[serde(default)]` so records written by older versions still decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue: String,
    pub kind: TaskKind,
    pub task_name: String,

    /// Opaque caller-defined bytes. `None` for recurring tasks.
    #[serde(default)]
    pub payload: Option<Vec<u8>>,

    pub status: TaskStatus,

    /// 0..=100, higher runs first.
    pub priority: u8,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Earliest time the task may be claimed.
    pub scheduled_at: DateTime<Utc>,

    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_owner: Option<String>,

    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Task {
    /// A new pending one-time task.
    pub fn one_time(
        id: TaskId,
        queue: impl Into<String>,
        task_name: impl Into<String>,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            kind: TaskKind::OneTime,
            task_name: task_name.into(),
            payload: Some(payload),
            status: TaskStatus::Pending,
            priority: DEFAULT_PRIORITY,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_at: now,
            lease_expires_at: None,
            lease_owner: None,
            processed_at: None,
            last_error: None,
            created_at: now,
        }
    }

    /// A new pending recurring task (no payload) due at `scheduled_at`.
    pub fn recurring(
        id: TaskId,
        queue: impl Into<String>,
        task_name: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: TaskKind::Recurring,
            payload: None,
            scheduled_at,
            ..Self::one_time(id, queue, task_name, Vec::new(), now)
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retry budget, clamped to [`MAX_RETRIES_CAP`].
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = clamp_max_retries(max_retries);
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }

    /// Payload bytes, empty when the task carries none.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Does the task hold a lease that is still valid at `now`?
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lease_expires_at, Some(expires) if expires > now)
    }

    /// Can a claimer take this task at `now`?
    ///
    /// A processing task whose lease lapsed counts as pending.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.scheduled_at > now {
            return false;
        }
        match self.status {
            TaskStatus::Pending | TaskStatus::Processing => !self.has_live_lease(now),
            TaskStatus::Completed | TaskStatus::Failed => false,
        }
    }

    /// Pending -> Processing with a lease for `owner`.
    pub fn start_processing(&mut self, owner: &str, lease_expires_at: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(lease_expires_at);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.processed_at = Some(now);
        self.release_lease();
    }

    /// Back to pending after a failure, eligible again at `next_run_at`.
    pub fn schedule_retry(&mut self, next_run_at: DateTime<Utc>, error: String) {
        self.status = TaskStatus::Pending;
        self.scheduled_at = next_run_at;
        self.last_error = Some(error);
        self.release_lease();
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: String) {
        self.status = TaskStatus::Failed;
        self.processed_at = Some(now);
        self.last_error = Some(error);
        self.release_lease();
    }

    /// Expired lease: give the task back to the pool without touching the retry budget.
    pub fn reclaim(&mut self) {
        self.status = TaskStatus::Pending;
        self.release_lease();
    }

    fn release_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

pub fn clamp_max_retries(max_retries: u32) -> u32 {
    max_retries.min(MAX_RETRIES_CAP)
}
