//! DispatcherBuilder - wiring with startup validation.
//!
//! `expect_tasks` declares which task names this process must be able to
//! run; `build` fails if any of them has no handler, instead of letting
//! the dispatcher dead-letter them one by one at runtime.

use std::future::Future;
use std::sync::Arc;

use super::dispatcher::Dispatcher;
use crate::config::DispatcherConfig;
use crate::error::{BuildError, HandlerError};
use crate::ports::DispatcherStore;
use crate::typed::{ExecutionContext, Handler, HandlerRegistry, RegistryError, TaskPayload};

/// # Example
/// ```ignore
/// let dispatcher = DispatcherBuilder::new(store)
///     .register::<SendWelcomeEmail, _>(SendWelcomeEmailHandler)?
///     .expect_tasks(&[SendWelcomeEmail::task_name()])
///     .config(config.dispatcher)
///     .build()?;
/// ```
pub struct DispatcherBuilder {
    store: Arc<dyn DispatcherStore>,
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<String>>,
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    pub fn new(store: Arc<dyn DispatcherStore>) -> Self {
        Self {
            store,
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            config: DispatcherConfig::default(),
        }
    }

    pub fn register<T: TaskPayload, H: Handler<T> + 'static>(
        self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_fn<F, Fut>(
        self,
        task_name: impl Into<String>,
        f: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(ExecutionContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.registry.register_fn(task_name, f)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_names: &[&str]) -> Self {
        self.expected_tasks = Some(task_names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Dispatcher, BuildError> {
        if let Some(expected) = &self.expected_tasks {
            let registered = self.registry.registered_names();
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !registered.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskNames(missing));
            }
        }
        Ok(Dispatcher::new(
            self.store,
            Arc::new(self.registry),
            self.config,
        )?)
    }
}
