//! Handler traits - what the dispatcher calls to execute a task.
//!
//! Two layers:
//! - **Typed**: `Handler<T>` receives a decoded `T: TaskPayload`
//! - **Dyn**: `DynHandler` receives raw bytes and is object-safe, so the
//!   registry can hold `Arc<dyn DynHandler>` keyed by task name
//!
//! `TypedHandler<T, H>` erases the type; `FnHandler` adapts async closures.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::task::TaskPayload;
use crate::domain::{Task, TaskId};
use crate::error::{HandlerError, StoreError};
use crate::ports::DispatcherStore;

/// Per-execution scope handed to a handler.
///
/// The scope is bounded by the handler timeout, not by the dispatcher's
/// lifecycle: a dispatcher that is stopping still lets the handler run
/// to completion or to its deadline.
#[derive(Clone)]
pub struct ExecutionContext {
    task_id: TaskId,
    task_name: String,
    queue: String,
    retry_count: u32,
    deadline: Instant,
    store: Arc<dyn DispatcherStore>,
}

impl ExecutionContext {
    pub fn new(task: &Task, deadline: Instant, store: Arc<dyn DispatcherStore>) -> Self {
        Self {
            task_id: task.id,
            task_name: task.task_name.clone(),
            queue: task.queue.clone(),
            retry_count: task.retry_count,
            deadline,
            store,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Failures recorded before this attempt.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Resolves when the execution budget runs out. Use in `select!` to
    /// stop cooperatively before the dispatcher drops the future.
    pub async fn cancelled(&self) {
        tokio::time::sleep_until(self.deadline).await
    }

    /// Keep the lease alive for another `duration` from now.
    ///
    /// Long-running handlers call this before the lease lapses; otherwise
    /// the reclaimer may hand the task to another dispatcher.
    pub async fn extend_lease(&self, duration: Duration) -> Result<DateTime<Utc>, StoreError> {
        self.store.extend_lease(self.task_id, duration).await
    }
}

/// Object-safe handler over raw payload bytes.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, ctx: ExecutionContext, payload: Vec<u8>)
    -> Result<(), HandlerError>;
}

/// Strongly-typed handler for payload `T`.
///
/// # Example
/// ```ignore
/// struct SendWelcomeEmailHandler;
///
/// #[async_trait]
/// impl Handler<SendWelcomeEmail> for SendWelcomeEmailHandler {
///     async fn handle(&self, _ctx: &ExecutionContext, task: SendWelcomeEmail) -> Result<(), HandlerError> {
///         mailer::send(task.user_id).await.map_err(|e| HandlerError::msg(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: TaskPayload>: Send + Sync {
    async fn handle(&self, ctx: &ExecutionContext, task: T) -> Result<(), HandlerError>;
}

/// Decodes JSON bytes into `T` before calling the inner handler.
///
/// 空の payload（recurring task は payload を持たない）は JSON `null` として
/// decode する。unit struct や `Option<_>` の payload はそのまま受け取れる。
pub struct TypedHandler<T: TaskPayload, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: TaskPayload, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TaskPayload, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        ctx: ExecutionContext,
        payload: Vec<u8>,
    ) -> Result<(), HandlerError> {
        let bytes: &[u8] = if payload.is_empty() { b"null" } else { &payload };
        let task: T = serde_json::from_slice(bytes)?;
        self.handler.handle(&ctx, task).await
    }
}

/// Adapts an async closure over raw bytes. Handy for recurring tasks,
/// which carry no payload.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(ExecutionContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle_dyn(
        &self,
        ctx: ExecutionContext,
        payload: Vec<u8>,
    ) -> Result<(), HandlerError> {
        (self.f)(ctx, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DEFAULT_QUEUE;
    use crate::queue::InMemoryTaskStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    impl TaskPayload for Resize {}

    struct ResizeHandler;

    #[async_trait]
    impl Handler<Resize> for ResizeHandler {
        async fn handle(&self, _ctx: &ExecutionContext, task: Resize) -> Result<(), HandlerError> {
            if task.width == 0 {
                return Err(HandlerError::msg("zero width"));
            }
            Ok(())
        }
    }

    fn ctx() -> ExecutionContext {
        let task = Task::one_time(TaskId::generate(), DEFAULT_QUEUE, "t", Vec::new(), Utc::now());
        ExecutionContext::new(
            &task,
            Instant::now() + Duration::from_secs(5),
            Arc::new(InMemoryTaskStore::default()),
        )
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = TypedHandler::<Resize, _>::new(ResizeHandler);

        handler.handle_dyn(ctx(), br#"{"width":640}"#.to_vec()).await.unwrap();

        let err = handler
            .handle_dyn(ctx(), br#"{"width":0}"#.to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "zero width");
    }

    #[tokio::test]
    async fn typed_handler_surfaces_decode_failure() {
        let handler = TypedHandler::<Resize, _>::new(ResizeHandler);
        let err = handler.handle_dyn(ctx(), b"not json".to_vec()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }

    #[derive(Serialize, Deserialize)]
    struct Heartbeat;

    impl TaskPayload for Heartbeat {}

    struct HeartbeatHandler;

    #[async_trait]
    impl Handler<Heartbeat> for HeartbeatHandler {
        async fn handle(&self, _ctx: &ExecutionContext, _task: Heartbeat) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_handler_reads_empty_payload_as_null() {
        let handler = TypedHandler::<Heartbeat, _>::new(HeartbeatHandler);
        handler.handle_dyn(ctx(), Vec::new()).await.unwrap();
        handler.handle_dyn(ctx(), b"null".to_vec()).await.unwrap();

        // a struct with fields still needs a real body
        let resize = TypedHandler::<Resize, _>::new(ResizeHandler);
        let err = resize.handle_dyn(ctx(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }

    #[tokio::test]
    async fn fn_handler_runs_closure() {
        let handler = FnHandler::new(|ctx: ExecutionContext, payload: Vec<u8>| async move {
            assert_eq!(ctx.queue(), DEFAULT_QUEUE);
            if payload.is_empty() {
                Ok(())
            } else {
                Err(HandlerError::msg("unexpected payload"))
            }
        });
        handler.handle_dyn(ctx(), Vec::new()).await.unwrap();
        assert!(handler.handle_dyn(ctx(), vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn context_reports_remaining_budget() {
        let ctx = ctx();
        assert!(ctx.remaining() <= Duration::from_secs(5));
        assert!(ctx.remaining() > Duration::from_secs(4));
        assert_eq!(ctx.retry_count(), 0);
    }
}
