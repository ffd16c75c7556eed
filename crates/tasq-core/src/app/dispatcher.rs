//! Dispatcher - the pull loop that claims tasks and runs their handlers.
//!
//! One polling loop per dispatcher plus at most `concurrency` handler
//! executions. Slots are permits of a counted semaphore; a tick that cannot
//! get a permit without waiting is skipped.
//!
//! # 実行の流れ
//! 1. tick ごとに空き slot がある限り `claim_task` する
//! 2. task name で handler を引く。見つからなければ retry せず dead-letter
//! 3. handler は別 task で `handler_timeout` 付きで実行する。panic は
//!    `JoinError` として拾い、通常の失敗と同じく `fail_task` に記録する
//!
//! # 停止
//! `stop` は claim を止めたうえで、実行中の handler が complete/fail を
//! 記録し終えるまで待つ。並行して呼ばれた `stop` も同じ完了を待つ。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::DispatcherConfig;
use crate::domain::Task;
use crate::error::{ConfigError, DispatcherError, HandlerError};
use crate::ports::{DispatcherStore, FailOutcome};
use crate::typed::{DynHandler, ExecutionContext, HandlerRegistry};

struct Inner {
    pool_id: String,
    queues: Vec<String>,
    concurrency: usize,
    poll_interval: Duration,
    lease_duration: Duration,
    handler_timeout: Duration,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn DispatcherStore>,
    permits: Arc<Semaphore>,
    /// Spawned executions that have not recorded their outcome yet.
    in_flight: AtomicUsize,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct Dispatcher {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
    // held for the whole of `stop`, so a second caller waits for quiescence
    stopping: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DispatcherStore>,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool_id = config
            .pool_id
            .clone()
            .unwrap_or_else(|| format!("dispatcher-{}", Ulid::new()));
        Ok(Self {
            inner: Arc::new(Inner {
                pool_id,
                queues: config.queues.clone(),
                concurrency: config.concurrency,
                poll_interval: config.poll_interval(),
                lease_duration: config.lease_duration(),
                handler_timeout: config.handler_timeout(),
                registry,
                store,
                permits: Arc::new(Semaphore::new(config.concurrency)),
                in_flight: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
            stopping: tokio::sync::Mutex::new(()),
        })
    }

    /// Lease owner name written on every claimed task.
    pub fn pool_id(&self) -> &str {
        &self.inner.pool_id
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Handler executions that have not recorded their outcome yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Spawn the pull loop. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), DispatcherError> {
        if self.inner.registry.is_empty() {
            return Err(DispatcherError::NoHandlersRegistered);
        }
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(DispatcherError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move { inner.run(shutdown_rx).await });
        *running = Some(Running { shutdown_tx, join });

        info!(
            pool_id = %self.inner.pool_id,
            queues = ?self.inner.queues,
            concurrency = self.inner.concurrency,
            handlers = ?self.inner.registry.registered_names(),
            "dispatcher started"
        );
        Ok(())
    }

    /// Stop claiming, then wait until every in-flight execution has
    /// recorded its terminal state. A stopped dispatcher can be started
    /// again.
    pub async fn stop(&self) {
        let _stopping = self.stopping.lock().await;
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(running) = running else {
            return;
        };

        // receivers may already be gone if the loop exited on its own
        let _ = running.shutdown_tx.send(true);
        if let Err(err) = running.join.await {
            error!(pool_id = %self.inner.pool_id, error = %err, "dispatcher loop aborted");
        }

        // every slot back in hand means nothing is executing
        let all = u32::try_from(self.inner.concurrency).unwrap_or(u32::MAX);
        if let Ok(permits) = self.inner.permits.acquire_many(all).await {
            drop(permits);
        }
        info!(pool_id = %self.inner.pool_id, "dispatcher stopped");
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.fill_slots(&shutdown_rx).await,
            }
        }
        debug!(pool_id = %self.pool_id, "dispatcher loop exited");
    }

    /// Claim while a slot is free and work is available.
    async fn fill_slots(self: &Arc<Self>, shutdown_rx: &watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                debug!(pool_id = %self.pool_id, "all slots busy, skipping tick");
                return;
            };

            match self
                .store
                .claim_task(&self.pool_id, &self.queues, self.lease_duration)
                .await
            {
                Ok(Some(task)) => self.dispatch(task, permit).await,
                Ok(None) => {
                    debug!(pool_id = %self.pool_id, "no task available");
                    return;
                }
                Err(err) => {
                    error!(pool_id = %self.pool_id, error = %err, "claim failed");
                    return;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, task: Task, permit: OwnedSemaphorePermit) {
        let Some(handler) = self.registry.get(&task.task_name) else {
            let err = DispatcherError::HandlerNotFound(task.task_name.clone());
            warn!(
                task_id = %task.id,
                task_name = %task.task_name,
                queue = %task.queue,
                "{err}, dead-lettering"
            );
            if let Err(store_err) = self.store.move_to_dead_letter(task.id, &err.to_string()).await {
                error!(task_id = %task.id, error = %store_err, "dead-lettering failed");
            }
            return;
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            inner.execute(task, handler).await;
            inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    async fn execute(&self, task: Task, handler: Arc<dyn DynHandler>) {
        let deadline = Instant::now() + self.handler_timeout;
        let ctx = ExecutionContext::new(&task, deadline, Arc::clone(&self.store));
        let payload = task.payload.clone().unwrap_or_default();

        debug!(
            task_id = %task.id,
            task_name = %task.task_name,
            retry_count = task.retry_count,
            "executing task"
        );

        // own task so a panic surfaces as a JoinError instead of unwinding here
        let execution = tokio::spawn(async move { handler.handle_dyn(ctx, payload).await });
        let abort = execution.abort_handle();
        let result = match tokio::time::timeout_at(deadline, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(HandlerError::Panicked(panic_message(join_err))),
            Err(_) => {
                abort.abort();
                Err(HandlerError::TimedOut(self.handler_timeout))
            }
        };

        self.record(&task, result).await;
    }

    async fn record(&self, task: &Task, result: Result<(), HandlerError>) {
        match result {
            Ok(()) => match self.store.complete_task(task.id).await {
                Ok(()) => info!(task_id = %task.id, task_name = %task.task_name, "task completed"),
                Err(err) => error!(task_id = %task.id, error = %err, "completing task failed"),
            },
            Err(handler_err) => {
                let message = handler_err.to_string();
                match self.store.fail_task(task.id, &message).await {
                    Ok(FailOutcome::Retrying {
                        retry_count,
                        next_run_at,
                    }) => warn!(
                        task_id = %task.id,
                        task_name = %task.task_name,
                        retry_count,
                        %next_run_at,
                        error = %message,
                        "task failed, retry scheduled"
                    ),
                    Ok(FailOutcome::DeadLettered { retry_count }) => warn!(
                        task_id = %task.id,
                        task_name = %task.task_name,
                        retry_count,
                        error = %message,
                        "task failed, retries exhausted"
                    ),
                    Err(err) => error!(task_id = %task.id, error = %err, "recording failure failed"),
                }
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
