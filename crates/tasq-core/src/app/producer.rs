//! Producer - 呼び出し側の payload を pending task として永続化する。
//!
//! priority・遅延・retry 予算は [`EnqueueOptions`] で呼び出しごとに上書きでき、
//! 指定がなければ [`ProducerConfig`] の既定値を使います。retry 予算は上限で
//! 切り詰められます。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::ProducerConfig;
use crate::domain::{DeadLetter, MAX_PRIORITY, Task, TaskId};
use crate::error::{ConfigError, ProducerError};
use crate::ports::{Clock, IdGenerator, ProducerStore, SystemClock, UlidGenerator};
use crate::typed::TaskPayload;

/// Per-call overrides. Unset fields fall back to [`ProducerConfig`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub queue: Option<String>,
    pub priority: Option<u8>,
    pub max_retries: Option<u32>,
    pub delay: Option<Duration>,
    /// Wins over `delay` when both are set.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub task_name: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }
}

pub struct Producer {
    store: Arc<dyn ProducerStore>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(store: Arc<dyn ProducerStore>, config: ProducerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ProducerStore>,
        config: ProducerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            ids: Box::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            config,
        })
    }

    /// Serialize `payload` as JSON and persist it as a pending task named
    /// after `T` (unless `options.task_name` overrides it).
    ///
    /// `&T` は nil にならない。unit struct や `None` は JSON `null` として
    /// そのまま保存され、`TypedHandler` 側で同じ値に decode される。
    pub async fn enqueue<T: TaskPayload>(
        &self,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<TaskId, ProducerError> {
        let bytes = serde_json::to_vec(payload).map_err(ProducerError::SerializationFailed)?;
        self.enqueue_raw(T::task_name(), bytes, options).await
    }

    /// Persist pre-serialized bytes under `task_name`.
    ///
    /// 空の bytes は payload なしとみなして `PayloadRequired` を返す。
    pub async fn enqueue_raw(
        &self,
        task_name: &str,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<TaskId, ProducerError> {
        if payload.is_empty() {
            return Err(ProducerError::PayloadRequired);
        }
        let priority = options.priority.unwrap_or(self.config.default_priority);
        if priority > MAX_PRIORITY {
            return Err(ProducerError::InvalidPriority(priority));
        }

        let now = self.clock.now();
        let scheduled_at = match (options.scheduled_at, options.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta))
                .ok_or(ProducerError::InvalidDelay(delay))?,
            (None, None) => now,
        };

        let task_name = options.task_name.as_deref().unwrap_or(task_name);
        let queue = options
            .queue
            .unwrap_or_else(|| self.config.default_queue.clone());
        let task = Task::one_time(self.ids.generate_task_id(), queue, task_name, payload, now)
            .with_priority(priority)
            .with_max_retries(options.max_retries.unwrap_or(self.config.default_max_retries))
            .with_scheduled_at(scheduled_at);
        let id = task.id;

        info!(
            task_id = %id,
            task_name = %task.task_name,
            queue = %task.queue,
            priority,
            %scheduled_at,
            "enqueueing task"
        );
        self.store
            .create_task(task)
            .await
            .map_err(ProducerError::PersistenceFailed)?;
        Ok(id)
    }

    /// Manual re-enqueue of dead-lettered work as a fresh one-time task.
    ///
    /// Queue, name, payload and priority come from the snapshot unless
    /// `options` overrides them.
    pub async fn requeue_dead_letter(
        &self,
        dead_letter: &DeadLetter,
        options: EnqueueOptions,
    ) -> Result<TaskId, ProducerError> {
        let options = EnqueueOptions {
            queue: options.queue.or_else(|| Some(dead_letter.queue.clone())),
            priority: options.priority.or(Some(dead_letter.priority)),
            ..options
        };
        let payload = match &dead_letter.payload {
            Some(bytes) if !bytes.is_empty() => bytes.clone(),
            // recurring snapshots carry no payload
            _ => b"null".to_vec(),
        };
        self.enqueue_raw(&dead_letter.task_name, payload, options).await
    }
}
