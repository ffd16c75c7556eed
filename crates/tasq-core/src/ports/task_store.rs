//! TaskStore ports - キューの core が依存する永続化の契約。
//!
//! 役割ごとに 3 つの trait に分けています。1 つの backend が全部を実装して
//! かまいません。
//! - [`ProducerStore`]: task の作成
//! - [`SchedulerStore`]: task の作成と、recurring task の pending 中の実体の検索
//! - [`DispatcherStore`]: claim / complete / fail / dead-letter / extend / reclaim
//!
//! # 一貫性の契約
//! - `claim_task` は選択と状態遷移を 1 ステップで行う。同一プロセス内でも
//!   プロセスをまたいでも、2 つの claimer が同じ task を受け取ることはない
//! - retry/backoff と dead-letter の分岐は `fail_task` の中にある。backend は
//!   dispatcher に触れずに backoff 曲線を変えられる
//! - lease による at-least-once 配送。lease を超えて動いた handler の task は
//!   reclaim 後に別の場所で再実行されうる
//!
//! # 時刻
//! 「今」は常に store 側の [`Clock`](crate::ports::Clock) で決まります。
//! 呼び出し側の時計とずれていても、claim 可否の判定は store の時刻に従います。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Task, TaskId};
use crate::error::StoreError;

/// What `fail_task` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending; eligible again at `next_run_at`.
    Retrying {
        retry_count: u32,
        next_run_at: DateTime<Utc>,
    },
    /// Retries exhausted; a dead-letter record was written.
    DeadLettered { retry_count: u32 },
}

#[async_trait]
pub trait ProducerStore: Send + Sync {
    /// Persist a new task. Rejects duplicate ids.
    async fn create_task(&self, task: Task) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SchedulerStore: ProducerStore {
    /// The pending task with this name, if any.
    async fn get_pending_task_by_name(&self, task_name: &str) -> Result<Option<Task>, StoreError>;
}

#[async_trait]
pub trait DispatcherStore: Send + Sync {
    /// Claim the best eligible task in `queues` for `owner`.
    ///
    /// Eligible: `scheduled_at <= now` and no unexpired lease. Highest
    /// priority wins, ties go to the earliest `scheduled_at`.
    /// Returns `Ok(None)` when nothing is eligible.
    async fn claim_task(
        &self,
        owner: &str,
        queues: &[String],
        lease: Duration,
    ) -> Result<Option<Task>, StoreError>;

    /// Processing -> Completed, lease released.
    async fn complete_task(&self, id: TaskId) -> Result<(), StoreError>;

    /// Record `message`, bump the retry count, then retry or dead-letter.
    async fn fail_task(&self, id: TaskId, message: &str) -> Result<FailOutcome, StoreError>;

    /// Dead-letter immediately, without consuming a retry.
    async fn move_to_dead_letter(&self, id: TaskId, reason: &str) -> Result<(), StoreError>;

    /// Push the lease expiry to `now + duration`. Returns the new expiry.
    async fn extend_lease(&self, id: TaskId, duration: Duration)
    -> Result<DateTime<Utc>, StoreError>;

    /// Return processing tasks with expired leases to pending.
    async fn reclaim_expired_leases(&self) -> Result<Vec<TaskId>, StoreError>;
}
