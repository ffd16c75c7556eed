//! Queue module: retry policy and the in-memory reference storage engine.

mod memory;
mod retry;

pub use memory::{InMemoryTaskStore, QueueCounts};
pub use retry::RetryPolicy;
