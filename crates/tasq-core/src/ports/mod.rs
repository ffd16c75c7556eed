//! Ports - abstraction layer.
//!
//! Each trait is a seam to something outside the queue core: durable
//! storage, wall-clock time, id generation. The in-memory engine in
//! [`crate::queue`] is the reference implementation of the storage traits.

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{DispatcherStore, FailOutcome, ProducerStore, SchedulerStore};
