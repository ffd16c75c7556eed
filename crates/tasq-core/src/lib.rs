//! tasq-core
//!
//! Storage-agnostic background task queue: immediate, delayed and
//! recurring work, claimed under leases and retried with backoff.
//!
//! # Modules
//! - **domain**: task record, identifiers, dead-letter snapshot
//! - **ports**: storage contract, clock, id generation
//! - **queue**: retry policy and the in-memory reference store
//! - **typed**: task payloads, handlers, handler registry
//! - **schedule**: recurrence rules
//! - **app**: producer, dispatcher, scheduler, lease reaper
//! - **config** / **error**: settings and error types

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod queue;
pub mod schedule;
pub mod typed;

pub use app::{
    Dispatcher, DispatcherBuilder, EnqueueOptions, Producer, ReaperLoop, ScheduleOptions,
    Scheduler,
};
pub use config::TasqConfig;
pub use domain::{DeadLetter, Task, TaskId, TaskKind, TaskStatus};
pub use queue::{InMemoryTaskStore, RetryPolicy};
pub use typed::{ExecutionContext, Handler, HandlerRegistry, TaskPayload};
