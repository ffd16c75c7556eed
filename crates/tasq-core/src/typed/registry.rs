//! HandlerRegistry - task name -> handler lookup table.
//!
//! Populated at startup, read on every claimed task. Lookups may overlap
//! with late registrations, so the table sits behind an `RwLock`; reads
//! clone the `Arc` out and never hold the lock across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use super::handler::{DynHandler, FnHandler, Handler, TypedHandler};
use super::task::TaskPayload;
use crate::error::HandlerError;
use crate::typed::ExecutionContext;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task name '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn DynHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler under `T::task_name()`.
    pub fn register<T: TaskPayload, H: Handler<T> + 'static>(
        &self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(T::task_name(), Arc::new(TypedHandler::new(handler)))
    }

    /// Register an async closure over raw bytes under an explicit name.
    pub fn register_fn<F, Fut>(&self, task_name: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(ExecutionContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register_dyn(task_name, Arc::new(FnHandler::new(f)))
    }

    pub fn register_dyn(
        &self,
        task_name: impl Into<String>,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), RegistryError> {
        let task_name = task_name.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&task_name) {
            return Err(RegistryError::AlreadyRegistered(task_name));
        }
        handlers.insert(task_name, handler);
        Ok(())
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_name)
            .cloned()
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping;

    impl TaskPayload for Ping {
        fn task_name() -> &'static str {
            "test.ping.v1"
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Pong {
        seq: u64,
    }

    impl TaskPayload for Pong {}

    struct PingHandler;

    #[async_trait]
    impl Handler<Ping> for PingHandler {
        async fn handle(&self, _ctx: &ExecutionContext, _task: Ping) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct PongHandler;

    #[async_trait]
    impl Handler<Pong> for PongHandler {
        async fn handle(&self, _ctx: &ExecutionContext, _task: Pong) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = HandlerRegistry::new();
        registry.register::<Ping, _>(PingHandler).unwrap();

        assert!(registry.get("test.ping.v1").is_some());
        assert!(registry.get(Pong::task_name()).is_none());
    }

    #[test]
    fn test_double_registration() {
        let registry = HandlerRegistry::new();
        registry.register::<Ping, _>(PingHandler).unwrap();
        let result = registry.register_fn("test.ping.v1", |_, _| async { Ok(()) });
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(name)) if name == "test.ping.v1"));
    }

    #[test]
    fn test_registered_names() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        registry.register::<Ping, _>(PingHandler).unwrap();
        registry.register::<Pong, _>(PongHandler).unwrap();
        registry.register_fn("cleanup", |_, _| async { Ok(()) }).unwrap();

        assert_eq!(registry.len(), 3);
        let names = registry.registered_names();
        assert!(names.contains(&"cleanup".to_string()));
        assert!(names.contains(&Pong::task_name().to_string()));
    }

    #[test]
    fn test_lookup_while_registering() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register::<Ping, _>(PingHandler).unwrap();

        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..200 {
                    registry
                        .register_fn(format!("late.{i}"), |_, _| async { Ok(()) })
                        .unwrap();
                }
            })
        };
        for _ in 0..200 {
            assert!(registry.get("test.ping.v1").is_some());
        }
        writer.join().unwrap();
        assert_eq!(registry.len(), 201);
    }
}
