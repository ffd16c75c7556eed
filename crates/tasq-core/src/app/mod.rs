//! App - the actors built on top of the ports.
//!
//! - **Producer**: validates and persists new tasks
//! - **Dispatcher**: claims tasks and runs their handlers
//! - **DispatcherBuilder**: registers handlers, checks expectations at build time
//! - **Scheduler**: materializes recurring tasks from recurrence rules
//! - **ReaperLoop**: releases expired leases
//!
//! The actors only share the storage traits, so each may run in its own
//! process against the same backend.

pub mod builder;
pub mod dispatcher;
pub mod producer;
pub mod reaper_loop;
pub mod scheduler;

pub use self::builder::DispatcherBuilder;
pub use self::dispatcher::Dispatcher;
pub use self::producer::{EnqueueOptions, Producer};
pub use self::reaper_loop::ReaperLoop;
pub use self::scheduler::{ScheduleOptions, Scheduler};
