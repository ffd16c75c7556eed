//! ReaperLoop - returns tasks with expired leases to pending.
//!
//! Claimers already treat an expired lease as free, so this loop only
//! shortens how long a crashed dispatcher's work looks "processing".

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ReaperConfig;
use crate::domain::TaskId;
use crate::error::{ConfigError, StoreError};
use crate::ports::DispatcherStore;

struct Running {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct ReaperLoop {
    store: Arc<dyn DispatcherStore>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl ReaperLoop {
    pub fn new(store: Arc<dyn DispatcherStore>, config: ReaperConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            interval: config.interval(),
            running: Mutex::new(None),
        })
    }

    /// One sweep. Returns the reclaimed task ids.
    pub async fn run_once(&self) -> Result<Vec<TaskId>, StoreError> {
        sweep(self.store.as_ref()).await
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Spawn the periodic sweep. Starting twice is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let interval = self.interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
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
                        if let Err(err) = sweep(store.as_ref()).await {
                            error!(error = %err, "lease reclaim failed");
                        }
                    }
                }
            }
        });
        *running = Some(Running { shutdown_tx, join });
        info!(interval = ?self.interval, "reaper started");
    }

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
            error!(error = %err, "reaper loop aborted");
        }
        info!("reaper stopped");
    }
}

async fn sweep(store: &dyn DispatcherStore) -> Result<Vec<TaskId>, StoreError> {
    let reclaimed = store.reclaim_expired_leases().await?;
    if reclaimed.is_empty() {
        debug!("no expired leases");
    } else {
        warn!(count = reclaimed.len(), task_ids = ?reclaimed, "reclaimed expired leases");
    }
    Ok(reclaimed)
}
