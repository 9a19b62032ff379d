//! The dispatch-ready execution unit and the type-erasure shim between the
//! typed [`TaskHandler`] world and the engine's untyped plumbing.
//!
//! A [`TaskExecutor`] travels from the dispatcher through the scheduler and
//! the queues to a worker. It carries routing metadata, the rhythm anchor
//! for recurring re-scheduling, and the handler in one of two forms: an
//! *eager* instance built at dispatch, or a *lazy* reference to the registry
//! entry, materialized only when the task actually runs. Either way the
//! instance is released when the execution completes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::AuditLevel;
use crate::recurring::RecurringSpec;
use crate::registry::HandlerEntry;
use crate::retry::RetryPolicy;
use crate::task::{TaskContext, TaskHandler};

/// Payload could not be decoded back into the task type. Never retried:
/// the bytes will not get better.
#[derive(Debug, Error)]
#[error("payload deserialization failed for {type_name}: {source}")]
pub struct PayloadDecodeError {
    pub type_name: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// Object-safe view over a typed handler.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn run(&self, request: &str, ctx: &TaskContext) -> anyhow::Result<()>;
    fn timeout(&self) -> Option<Duration>;
    fn retry_policy(&self) -> RetryPolicy;
    async fn on_started(&self, task_id: Uuid);
    async fn on_completed(&self, task_id: Uuid);
    async fn on_error(&self, task_id: Uuid, error: &str, message: &str);
    async fn on_retry(&self, task_id: Uuid, attempt: u32, error: &str);
}

/// Wraps a typed handler, decoding the JSON payload per attempt.
pub(crate) struct HandlerAdapter<H: TaskHandler> {
    inner: H,
}

impl<H: TaskHandler> HandlerAdapter<H> {
    pub(crate) fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: TaskHandler> ErasedHandler for HandlerAdapter<H> {
    async fn run(&self, request: &str, ctx: &TaskContext) -> anyhow::Result<()> {
        let task: H::Task = serde_json::from_str(request).map_err(|source| PayloadDecodeError {
            type_name: std::any::type_name::<H::Task>(),
            source,
        })?;
        self.inner.handle(task, ctx).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }

    async fn on_started(&self, task_id: Uuid) {
        self.inner.on_started(task_id).await;
    }

    async fn on_completed(&self, task_id: Uuid) {
        self.inner.on_completed(task_id).await;
    }

    async fn on_error(&self, task_id: Uuid, error: &str, message: &str) {
        self.inner.on_error(task_id, error, message).await;
    }

    async fn on_retry(&self, task_id: Uuid, attempt: u32, error: &str) {
        self.inner.on_retry(task_id, attempt, error).await;
    }
}

/// How the worker obtains the handler instance.
#[derive(Clone)]
pub(crate) enum HandlerResolution {
    /// Instance built at dispatch time; held until the execution completes.
    Eager(Arc<dyn ErasedHandler>),
    /// Built from the registry entry at execution time.
    Lazy(Arc<HandlerEntry>),
}

/// One execution of one task, ready to route.
#[derive(Clone)]
pub(crate) struct TaskExecutor {
    pub(crate) task_id: Uuid,
    pub(crate) task_type: String,
    pub(crate) request: String,
    pub(crate) queue_name: Option<String>,
    pub(crate) audit_level: AuditLevel,
    pub(crate) recurring: Option<RecurringSpec>,
    /// The originally scheduled fire time - the rhythm anchor. `None` for
    /// immediate dispatch.
    pub(crate) scheduled_for: Option<DateTime<Utc>>,
    /// Recurring executions completed before this one.
    pub(crate) current_run: i32,
    /// False when persistence failed and the task runs best-effort.
    pub(crate) persisted: bool,
    pub(crate) handler: HandlerResolution,
}

impl TaskExecutor {
    pub(crate) fn resolve_handler(&self) -> Arc<dyn ErasedHandler> {
        match &self.handler {
            HandlerResolution::Eager(handler) => Arc::clone(handler),
            HandlerResolution::Lazy(entry) => entry.instantiate(),
        }
    }

    pub(crate) fn is_recurring(&self) -> bool {
        self.recurring.is_some()
    }

    /// The same task, advanced to its next occurrence.
    pub(crate) fn advanced(&self, next: DateTime<Utc>, completed_runs: i32) -> TaskExecutor {
        let mut next_executor = self.clone();
        next_executor.scheduled_for = Some(next);
        next_executor.current_run = completed_runs;
        next_executor
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("task_id", &self.task_id)
            .field("task_type", &self.task_type)
            .field("queue_name", &self.queue_name)
            .field("scheduled_for", &self.scheduled_for)
            .field("current_run", &self.current_run)
            .finish_non_exhaustive()
    }
}
