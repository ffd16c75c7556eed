use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tasq_core::error::HandlerError;
use tasq_core::schedule::Every;
use tasq_core::{
    DispatcherBuilder, EnqueueOptions, ExecutionContext, Handler, InMemoryTaskStore, Producer,
    ReaperLoop, RetryPolicy, ScheduleOptions, Scheduler, TaskPayload, TasqConfig,
};

const CLEANUP_TASK: &str = "maintenance.cleanup";

#[derive(Debug, Serialize, Deserialize)]
struct SendWelcomeEmail {
    user_id: u64,
    address: String,
}

impl TaskPayload for SendWelcomeEmail {
    fn task_name() -> &'static str {
        "accounts.send_welcome_email.v1"
    }
}

/// Fails the first `flaky` deliveries to show the retry path.
struct WelcomeEmailHandler {
    flaky: AtomicU32,
}

#[async_trait]
impl Handler<SendWelcomeEmail> for WelcomeEmailHandler {
    async fn handle(
        &self,
        ctx: &ExecutionContext,
        task: SendWelcomeEmail,
    ) -> Result<(), HandlerError> {
        let left = self.flaky.load(Ordering::Relaxed);
        if left > 0 {
            self.flaky.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::msg(format!(
                "smtp relay unavailable (left={left})"
            )));
        }
        info!(
            task_id = %ctx.task_id(),
            attempt = ctx.retry_count() + 1,
            user_id = task.user_id,
            address = %task.address,
            "welcome email sent"
        );
        Ok(())
    }
}

fn init_logging() -> Result<(), Box<dyn Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

/// `TASQ_CONFIG` names a TOML file; defaults otherwise.
fn load_config() -> Result<TasqConfig, Box<dyn Error>> {
    match std::env::var("TASQ_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            let config = TasqConfig::from_toml_str(&raw)?;
            info!(%path, "config loaded");
            Ok(config)
        }
        Err(_) => Ok(TasqConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging()?;
    let config = load_config()?;

    let store = Arc::new(InMemoryTaskStore::new(RetryPolicy::exponential(
        Duration::from_secs(1),
        2.0,
        Duration::from_secs(10),
    )));

    let dispatcher = DispatcherBuilder::new(store.clone())
        .register::<SendWelcomeEmail, _>(WelcomeEmailHandler {
            flaky: AtomicU32::new(1),
        })?
        .register_fn(CLEANUP_TASK, |ctx, _payload| async move {
            info!(task_id = %ctx.task_id(), "cleanup ran");
            Ok(())
        })?
        .expect_tasks(&[SendWelcomeEmail::task_name(), CLEANUP_TASK])
        .config(config.dispatcher.clone())
        .build()?;

    let scheduler = Scheduler::new(store.clone(), config.scheduler.clone())?;
    scheduler.register(
        CLEANUP_TASK,
        Every::new(Duration::from_secs(3))?,
        ScheduleOptions::default().priority(10),
    )?;

    let reaper = ReaperLoop::new(store.clone(), config.reaper.clone())?;
    let producer = Producer::new(store.clone(), config.producer.clone())?;

    dispatcher.start()?;
    scheduler.start()?;
    reaper.start();

    producer
        .enqueue(
            &SendWelcomeEmail {
                user_id: 1,
                address: "ada@example.com".into(),
            },
            EnqueueOptions::new(),
        )
        .await?;
    producer
        .enqueue(
            &SendWelcomeEmail {
                user_id: 2,
                address: "grace@example.com".into(),
            },
            EnqueueOptions::new().priority(90),
        )
        .await?;
    producer
        .enqueue(
            &SendWelcomeEmail {
                user_id: 3,
                address: "edsger@example.com".into(),
            },
            EnqueueOptions::new().delay(Duration::from_secs(2)),
        )
        .await?;

    tokio::select! {
        _ = signal::ctrl_c() => warn!("interrupted"),
        _ = sleep(Duration::from_secs(10)) => {}
    }

    scheduler.stop().await;
    dispatcher.stop().await;
    reaper.stop().await;

    let counts = store.counts_by_status().await;
    info!(
        pending = counts.pending,
        processing = counts.processing,
        completed = counts.completed,
        failed = counts.failed,
        dead_letters = counts.dead_letters,
        "final queue state"
    );
    Ok(())
}
