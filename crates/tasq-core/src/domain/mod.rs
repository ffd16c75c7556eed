//! Domain model: identifiers, the task record and dead-letter snapshots.

pub mod dead_letter;
pub mod ids;
pub mod task;

pub use dead_letter::DeadLetter;
pub use ids::{DeadLetterId, Id, IdMarker, TaskId};
pub use task::{
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_QUEUE, MAX_PRIORITY, MAX_RETRIES_CAP, Task,
    TaskKind, TaskStatus, clamp_max_retries,
};
