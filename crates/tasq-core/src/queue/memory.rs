//! In-memory reference storage engine.
//!
//! すべての backend が再現すべき一貫性の契約をそのまま実装したものです。
//! テーブル全体を 1 つの tokio `Mutex` で守るので、task の選択と
//! `Processing` への遷移はプロセス内の全 claimer に対して atomic です。
//!
//! # claim の順序
//! 1. `priority` の高い順
//! 2. 同じ priority なら `scheduled_at` の早い順
//! 3. それも同じなら `created_at` の早い順
//!
//! `scheduled_at` が未来の task と、lease が生きている `Processing` の task は
//! 対象外です。lease の切れた `Processing` は reaper を待たずに再 claim できます。
//!
//! # 失敗時
//! `fail_task` は `retry_count` を進めたうえで、予算が残っていれば
//! [`RetryPolicy`](super::RetryPolicy) の backoff 後に `Pending` へ戻し、
//! 尽きていれば `Failed` にして dead-letter を 1 件書きます。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::RetryPolicy;
use crate::domain::{DeadLetter, DeadLetterId, Task, TaskId, TaskStatus};
use crate::error::StoreError;
use crate::ports::{
    Clock, DispatcherStore, FailOutcome, IdGenerator, ProducerStore, SchedulerStore, SystemClock,
    UlidGenerator,
};

/// Task counts per status, plus the dead-letter table size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letters: usize,
}

#[derive(Default)]
struct InMemoryState {
    /// All task records (single source of truth).
    tasks: HashMap<TaskId, Task>,

    /// Append-only; one record per buried task.
    dead_letters: Vec<DeadLetter>,
}

impl InMemoryState {
    /// Pick the best claimable task: highest priority, then earliest
    /// `scheduled_at`; `created_at` and id keep the order total.
    fn select_claimable(&self, queues: &[String], now: DateTime<Utc>) -> Option<TaskId> {
        self.tasks
            .values()
            .filter(|task| queues.iter().any(|q| *q == task.queue) && task.is_claimable(now))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.scheduled_at.cmp(&a.scheduled_at))
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|task| task.id)
    }

    fn processing_mut(&mut self, id: TaskId) -> Result<&mut Task, StoreError> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::TaskNotFound(id))?;
        if task.status != TaskStatus::Processing {
            return Err(StoreError::InvalidState {
                id,
                status: task.status,
            });
        }
        Ok(task)
    }

    /// Mark the task failed and write its dead-letter snapshot.
    fn bury(
        &mut self,
        id: TaskId,
        dead_letter_id: DeadLetterId,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let task = self.processing_mut(id)?;
        task.mark_failed(now, error.clone());
        let record = DeadLetter::from_task(dead_letter_id, task, error, now);
        let retry_count = record.retry_count;
        self.dead_letters.push(record);
        Ok(retry_count)
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            dead_letters: self.dead_letters.len(),
            ..QueueCounts::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// In-process implementation of all three storage ports.
pub struct InMemoryTaskStore {
    state: Mutex<InMemoryState>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
}

impl InMemoryTaskStore {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self::with_clock(retry_policy, Arc::new(SystemClock))
    }

    pub fn with_clock(retry_policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            retry_policy,
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub async fn get_task(&self, id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    /// Every task, in no particular order.
    pub async fn tasks(&self) -> Vec<Task> {
        self.state.lock().await.tasks.values().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    pub async fn counts_by_status(&self) -> QueueCounts {
        self.state.lock().await.counts()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

fn add_duration(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or(StoreError::InvalidDuration(duration))
}

#[async_trait]
impl ProducerStore for InMemoryTaskStore {
    async fn create_task(&self, task: Task) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::DuplicateTask(task.id));
        }
        debug!(task_id = %task.id, task_name = %task.task_name, queue = %task.queue, "task created");
        state.tasks.insert(task.id, task);
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for InMemoryTaskStore {
    async fn get_pending_task_by_name(&self, task_name: &str) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending && task.task_name == task_name)
            .min_by_key(|task| task.scheduled_at)
            .cloned())
    }
}

#[async_trait]
impl DispatcherStore for InMemoryTaskStore {
    async fn claim_task(
        &self,
        owner: &str,
        queues: &[String],
        lease: Duration,
    ) -> Result<Option<Task>, StoreError> {
        if lease.is_zero() {
            return Err(StoreError::InvalidDuration(lease));
        }
        let now = self.clock.now();
        let expires_at = add_duration(now, lease)?;

        let mut state = self.state.lock().await;
        let Some(id) = state.select_claimable(queues, now) else {
            return Ok(None);
        };
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };
        task.start_processing(owner, expires_at);
        debug!(task_id = %id, owner, %expires_at, "task claimed");
        Ok(Some(task.clone()))
    }

    async fn complete_task(&self, id: TaskId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.processing_mut(id)?.mark_completed(now);
        Ok(())
    }

    async fn fail_task(&self, id: TaskId, message: &str) -> Result<FailOutcome, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let task = state.processing_mut(id)?;
        task.retry_count += 1;
        let retry_count = task.retry_count;

        // バックオフが表現できない場合も dead-letter（Processing のまま残さない）
        let next_run_at = if retry_count >= task.max_retries {
            None
        } else {
            let delay = self.retry_policy.next_delay(retry_count);
            add_duration(now, delay)
                .inspect_err(|err| warn!(task_id = %id, retry_count, error = %err, "backoff out of range"))
                .ok()
        };

        match next_run_at {
            Some(next_run_at) => {
                task.schedule_retry(next_run_at, message.to_string());
                Ok(FailOutcome::Retrying {
                    retry_count,
                    next_run_at,
                })
            }
            None => {
                let dead_letter_id = self.ids.generate_dead_letter_id();
                state.bury(id, dead_letter_id, message.to_string(), now)?;
                Ok(FailOutcome::DeadLettered { retry_count })
            }
        }
    }

    async fn move_to_dead_letter(&self, id: TaskId, reason: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let dead_letter_id = self.ids.generate_dead_letter_id();
        let mut state = self.state.lock().await;
        state.bury(id, dead_letter_id, reason.to_string(), now)?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        id: TaskId,
        duration: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let expires_at = add_duration(self.clock.now(), duration)?;
        let mut state = self.state.lock().await;
        state.processing_mut(id)?.lease_expires_at = Some(expires_at);
        Ok(expires_at)
    }

    async fn reclaim_expired_leases(&self) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut reclaimed = Vec::new();
        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::Processing && !task.has_live_lease(now) {
                task.reclaim();
                reclaimed.push(task.id);
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::domain::{DEFAULT_QUEUE, TaskKind};
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    const LEASE: Duration = Duration::from_secs(60);

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn store() -> (InMemoryTaskStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(start()));
        let store = InMemoryTaskStore::with_clock(RetryPolicy::linear_default(), clock.clone());
        (store, clock)
    }

    fn queues() -> Vec<String> {
        vec![DEFAULT_QUEUE.to_string()]
    }

    fn task(name: &str) -> Task {
        Task::one_time(TaskId::generate(), DEFAULT_QUEUE, name, b"{}".to_vec(), start())
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let (store, _) = store();
        let t = task("a");
        store.create_task(t.clone()).await.unwrap();
        let err = store.create_task(t).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTask(_)));
    }

    #[tokio::test]
    async fn claim_on_empty_store_is_none() {
        let (store, _) = store();
        assert!(store.claim_task("w", &queues(), LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_prefers_higher_priority() {
        let (store, _) = store();
        let low = task("low").with_priority(25);
        let high = task("high").with_priority(75);
        store.create_task(low.clone()).await.unwrap();
        store.create_task(high.clone()).await.unwrap();

        let first = store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();
        let second = store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    async fn equal_priority_ties_break_on_earliest_scheduled_at() {
        let (store, _) = store();
        let later = task("later").with_scheduled_at(start() - chrono::Duration::seconds(10));
        let earlier = task("earlier").with_scheduled_at(start() - chrono::Duration::seconds(20));
        store.create_task(later.clone()).await.unwrap();
        store.create_task(earlier.clone()).await.unwrap();

        let first = store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();
        assert_eq!(first.id, earlier.id);
    }

    #[tokio::test]
    async fn claim_skips_other_queues_and_future_tasks() {
        let (store, clock) = store();
        let mut elsewhere = task("elsewhere");
        elsewhere.queue = "emails".into();
        let future = task("future").with_scheduled_at(start() + chrono::Duration::minutes(5));
        store.create_task(elsewhere).await.unwrap();
        store.create_task(future.clone()).await.unwrap();

        assert!(store.claim_task("w", &queues(), LEASE).await.unwrap().is_none());

        clock.advance(chrono::Duration::minutes(5));
        let claimed = store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, future.id);
    }

    #[tokio::test]
    async fn claim_sets_lease_and_status() {
        let (store, _) = store();
        store.create_task(task("a")).await.unwrap();

        let claimed = store.claim_task("pool-1", &queues(), LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.lease_owner.as_deref(), Some("pool-1"));
        assert_eq!(claimed.lease_expires_at, Some(start() + chrono::Duration::seconds(60)));
        assert!(store.claim_task("pool-2", &queues(), LEASE).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_task() {
        let store = Arc::new(InMemoryTaskStore::default());
        let mut created = HashSet::new();
        for i in 0..20 {
            let t = Task::one_time(TaskId::generate(), DEFAULT_QUEUE, "t", vec![i], Utc::now());
            created.insert(t.id);
            store.create_task(t).await.unwrap();
        }

        let mut joins = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                let owner = format!("w{worker}");
                let mut mine = Vec::new();
                while let Some(t) = store.claim_task(&owner, &queues(), LEASE).await.unwrap() {
                    mine.push(t.id);
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut claimed = Vec::new();
        for j in joins {
            claimed.extend(j.await.unwrap());
        }
        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 20);
        assert_eq!(unique, created);
    }

    #[tokio::test]
    async fn retry_law_with_three_retries() {
        let (store, clock) = store();
        let t = task("flaky").with_max_retries(3);
        store.create_task(t.clone()).await.unwrap();

        for expected in 1..=2u32 {
            let claimed = store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();
            let failed_at = clock.now();
            let outcome = store.fail_task(claimed.id, "boom").await.unwrap();
            let next_run_at = failed_at + chrono::Duration::seconds(30 * i64::from(expected));
            assert_eq!(
                outcome,
                FailOutcome::Retrying {
                    retry_count: expected,
                    next_run_at,
                }
            );
            let stored = store.get_task(t.id).await.unwrap();
            assert_eq!(stored.status, TaskStatus::Pending);
            assert_eq!(stored.retry_count, expected);
            assert_eq!(stored.last_error.as_deref(), Some("boom"));
            assert!(stored.lease_owner.is_none());

            // not eligible until the backoff has elapsed
            assert!(store.claim_task("w", &queues(), LEASE).await.unwrap().is_none());
            clock.set(next_run_at);
        }

        let claimed = store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();
        let outcome = store.fail_task(claimed.id, "final").await.unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered { retry_count: 3 });

        let stored = store.get_task(t.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 3);

        let dead = store.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task_id, t.id);
        assert_eq!(dead[0].retry_count, 3);
        assert_eq!(dead[0].error, "final");

        clock.advance(chrono::Duration::hours(1));
        assert!(store.claim_task("w", &queues(), LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unrepresentable_backoff_dead_letters_instead_of_stalling() {
        let clock = Arc::new(FixedClock::new(start()));
        let store = InMemoryTaskStore::with_clock(
            RetryPolicy::Linear {
                step: Duration::MAX,
            },
            clock,
        );
        let t = task("overflow").with_max_retries(3);
        store.create_task(t.clone()).await.unwrap();
        let claimed = store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();

        let outcome = store.fail_task(claimed.id, "boom").await.unwrap();

        assert_eq!(outcome, FailOutcome::DeadLettered { retry_count: 1 });
        let stored = store.get_task(t.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(stored.lease_owner.is_none());
        assert_eq!(store.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn move_to_dead_letter_keeps_retry_count() {
        let (store, _) = store();
        let t = task("orphan");
        store.create_task(t.clone()).await.unwrap();
        let claimed = store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();

        store.move_to_dead_letter(claimed.id, "no handler").await.unwrap();

        let stored = store.get_task(t.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.last_error.as_deref(), Some("no handler"));

        // exactly once
        let err = store.move_to_dead_letter(t.id, "again").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { status: TaskStatus::Failed, .. }));
        assert_eq!(store.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn operations_require_processing() {
        let (store, _) = store();
        let t = task("a");
        store.create_task(t.clone()).await.unwrap();

        assert!(matches!(
            store.complete_task(t.id).await,
            Err(StoreError::InvalidState { status: TaskStatus::Pending, .. })
        ));
        assert!(matches!(
            store.fail_task(t.id, "x").await,
            Err(StoreError::InvalidState { .. })
        ));
        assert!(matches!(
            store.extend_lease(t.id, LEASE).await,
            Err(StoreError::InvalidState { .. })
        ));
        assert!(matches!(
            store.complete_task(TaskId::generate()).await,
            Err(StoreError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn complete_marks_completed_and_releases_lease() {
        let (store, _) = store();
        let t = task("a");
        store.create_task(t.clone()).await.unwrap();
        store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();

        store.complete_task(t.id).await.unwrap();

        let stored = store.get_task(t.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.processed_at, Some(start()));
        assert!(stored.lease_expires_at.is_none());
        assert_eq!(store.counts_by_status().await.completed, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_claimable_by_another_owner() {
        let (store, clock) = store();
        let t = task("slow");
        store.create_task(t.clone()).await.unwrap();
        store.claim_task("crashed", &queues(), LEASE).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(61));
        let reclaimed = store.claim_task("rescuer", &queues(), LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, t.id);
        assert_eq!(reclaimed.lease_owner.as_deref(), Some("rescuer"));
    }

    #[tokio::test]
    async fn extend_lease_keeps_task_exclusive() {
        let (store, clock) = store();
        let t = task("long");
        store.create_task(t.clone()).await.unwrap();
        store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(50));
        let expires = store.extend_lease(t.id, LEASE).await.unwrap();
        assert_eq!(expires, clock.now() + chrono::Duration::seconds(60));

        clock.advance(chrono::Duration::seconds(30));
        assert!(store.claim_task("other", &queues(), LEASE).await.unwrap().is_none());
        assert!(store.reclaim_expired_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaimer_returns_expired_tasks_to_pending() {
        let (store, clock) = store();
        let t = task("a");
        store.create_task(t.clone()).await.unwrap();
        store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();

        assert!(store.reclaim_expired_leases().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(store.reclaim_expired_leases().await.unwrap(), vec![t.id]);

        let stored = store.get_task(t.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.lease_owner.is_none());
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn pending_lookup_by_name_ignores_other_states() {
        let (store, _) = store();
        let r = Task::recurring(TaskId::generate(), DEFAULT_QUEUE, "nightly", start(), start());
        store.create_task(r.clone()).await.unwrap();

        let found = store.get_pending_task_by_name("nightly").await.unwrap().unwrap();
        assert_eq!(found.id, r.id);
        assert_eq!(found.kind, TaskKind::Recurring);

        store.claim_task("w", &queues(), LEASE).await.unwrap().unwrap();
        assert!(store.get_pending_task_by_name("nightly").await.unwrap().is_none());
        assert!(store.get_pending_task_by_name("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_lease_is_rejected() {
        let (store, _) = store();
        store.create_task(task("a")).await.unwrap();
        let err = store.claim_task("w", &queues(), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDuration(_)));
    }
}
