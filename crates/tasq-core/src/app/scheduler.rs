//! Scheduler - recurrence rule から期限の来た recurring task を実体化する。
//!
//! 登録はメモリ上にしかありません。再起動後の登録は「前回実行なし」から
//! やり直しますが、`check_due` は同名の pending task を先に探して採用する
//! ので、以前のプロセス（または別の scheduler）が作った実体と重複しません。
//!
//! # 1 回の pass
//! - 前回の `scheduled_at`（なければ現在時刻）から次回を計算する
//! - 初回は常に作成し、2 回目以降は次回が現在時刻を過ぎていれば作成する
//! - 1 件の store エラーや範囲外の rule で pass 全体を止めない
//!
//! rule は設定された UTC offset で評価されます。「毎日 9:00」は offset 上の
//! 9:00 です。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::domain::{DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_QUEUE, MAX_PRIORITY, Task, TaskId};
use crate::error::{ConfigError, SchedulerError};
use crate::ports::{Clock, IdGenerator, SchedulerStore, SystemClock, UlidGenerator};
use crate::schedule::Recurrence;
use crate::typed::TaskPayload;

/// Where and how a recurring task's materializations are enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub queue: String,
    pub priority: u8,
    pub max_retries: u32,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ScheduleOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

struct Registration {
    rule: Arc<dyn Recurrence>,
    options: ScheduleOptions,
    last_run: Option<DateTime<Utc>>,
}

struct Inner {
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    offset: FixedOffset,
    check_interval: Duration,
    registrations: Mutex<BTreeMap<String, Registration>>,
    /// Serializes passes so a manual `check_due` cannot race the loop.
    pass: tokio::sync::Mutex<()>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn SchedulerStore>, config: SchedulerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SchedulerStore>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                ids: UlidGenerator::new(Arc::clone(&clock)),
                clock,
                offset: config.utc_offset()?,
                check_interval: config.check_interval(),
                registrations: Mutex::new(BTreeMap::new()),
                pass: tokio::sync::Mutex::new(()),
            }),
            running: Mutex::new(None),
        })
    }

    /// Register `rule` under `name`. Tasks are created with no payload.
    pub fn register(
        &self,
        name: impl Into<String>,
        rule: impl Recurrence + 'static,
        options: ScheduleOptions,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        if options.priority > MAX_PRIORITY {
            return Err(SchedulerError::InvalidPriority(options.priority));
        }
        let mut registrations = self.inner.registrations.lock().unwrap_or_else(|e| e.into_inner());
        if registrations.contains_key(&name) {
            return Err(SchedulerError::DuplicateTaskName(name));
        }
        debug!(task_name = %name, ?rule, queue = %options.queue, "recurring task registered");
        registrations.insert(
            name,
            Registration {
                rule: Arc::new(rule),
                options,
                last_run: None,
            },
        );
        Ok(())
    }

    /// Register under `T::task_name()`, so a typed handler can pick it up.
    pub fn register_payload<T: TaskPayload>(
        &self,
        rule: impl Recurrence + 'static,
        options: ScheduleOptions,
    ) -> Result<(), SchedulerError> {
        self.register(T::task_name(), rule, options)
    }

    /// Returns whether `name` was registered. Already materialized tasks
    /// stay in the store.
    pub fn deregister(&self, name: &str) -> bool {
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Last materialized (or adopted) run time for `name`.
    pub fn last_run(&self, name: &str) -> Option<DateTime<Utc>> {
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .and_then(|registration| registration.last_run)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// One pass over all registrations. Returns the ids of tasks created.
    pub async fn check_due(&self) -> Vec<TaskId> {
        self.inner.check_due().await
    }

    /// Check immediately, then every `check_interval` until [`Scheduler::stop`].
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }
        if self.registered_names().is_empty() {
            return Err(SchedulerError::NoTasksRegistered);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move { inner.run(shutdown_rx).await });
        *running = Some(Running { shutdown_tx, join });

        info!(
            check_interval = ?self.inner.check_interval,
            utc_offset = %self.inner.offset,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the loop. A pass in progress finishes first.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(err) = running.join.await {
            error!(error = %err, "scheduler loop aborted");
        }
        info!("scheduler stopped");
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        // first tick fires immediately
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.check_due().await;
                }
            }
        }
    }

    async fn check_due(&self) -> Vec<TaskId> {
        let _pass = self.pass.lock().await;
        let now = self.clock.now();

        // snapshot, so the registration lock is never held across a store call
        let due: Vec<(String, Arc<dyn Recurrence>, ScheduleOptions, Option<DateTime<Utc>>)> = self
            .registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, r)| (name.clone(), Arc::clone(&r.rule), r.options.clone(), r.last_run))
            .collect();

        let mut created = Vec::new();
        for (name, rule, options, last_run) in due {
            let from = last_run.unwrap_or(now).with_timezone(&self.offset);
            let Some(next) = rule.next(from).map(|next| next.with_timezone(&Utc)) else {
                error!(task_name = %name, %from, ?rule, "next run is out of range, skipping");
                continue;
            };
            if last_run.is_some() && next > now {
                debug!(task_name = %name, %next, "not due");
                continue;
            }

            let materialized = match self.store.get_pending_task_by_name(&name).await {
                Ok(Some(pending)) => {
                    debug!(
                        task_name = %name,
                        task_id = %pending.id,
                        scheduled_at = %pending.scheduled_at,
                        "pending task already exists, adopting"
                    );
                    pending.scheduled_at
                }
                Ok(None) => {
                    let task = Task::recurring(self.ids.generate_task_id(), &options.queue, &name, next, now)
                        .with_priority(options.priority)
                        .with_max_retries(options.max_retries);
                    let id = task.id;
                    if let Err(err) = self.store.create_task(task).await {
                        error!(task_name = %name, error = %err, "creating recurring task failed");
                        continue;
                    }
                    info!(task_name = %name, task_id = %id, scheduled_at = %next, "recurring task materialized");
                    created.push(id);
                    next
                }
                Err(err) => {
                    error!(task_name = %name, error = %err, "pending task lookup failed");
                    continue;
                }
            };

            // skip the write-back if it was deregistered meanwhile
            if let Some(registration) = self
                .registrations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_mut(&name)
            {
                registration.last_run = Some(materialized);
            }
        }
        created
    }
}
