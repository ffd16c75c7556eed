//! Typed - task payloads, handlers and the handler registry.
//!
//! # Two layers
//! - **Typed**: `TaskPayload`, `Handler<T>` - the payload type picks the handler
//! - **Dyn**: `DynHandler` - object-safe, stored in the registry by task name

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{DynHandler, ExecutionContext, FnHandler, Handler, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::task::TaskPayload;
