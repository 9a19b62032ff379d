//! The task and handler contract.
//!
//! A *task* is a serializable payload; a *handler* is the object that
//! executes it. Handlers opt into per-type policy (queue, timeout, retry)
//! and may observe lifecycle callbacks. Callback failures are caught and
//! logged; they never change the outcome of the task itself.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct SendWelcomeEmail {
//!     user_id: Uuid,
//! }
//!
//! struct SendWelcomeEmailHandler {
//!     mailer: Mailer,
//! }
//!
//! #[async_trait]
//! impl TaskHandler for SendWelcomeEmailHandler {
//!     type Task = SendWelcomeEmail;
//!
//!     async fn handle(&self, task: SendWelcomeEmail, ctx: &TaskContext) -> anyhow::Result<()> {
//!         ctx.logger().info(format!("sending welcome email to {}", task.user_id));
//!         self.mailer.send(task.user_id).await
//!     }
//!
//!     fn queue(&self) -> Option<&str> {
//!         Some("emails")
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::logging::TaskLogger;
use crate::retry::RetryPolicy;

/// Anything serializable can be a task payload.
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> TaskPayload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Executes one task type.
///
/// The engine constructs handler instances through the factory registered
/// for the type - eagerly at dispatch or lazily at execution, depending on
/// the resolution strategy - and releases them when the execution completes.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Task: TaskPayload;

    /// Execute the task. Long-running handlers should observe
    /// [`TaskContext::cancellation`] and return promptly when it fires.
    async fn handle(&self, task: Self::Task, ctx: &TaskContext) -> anyhow::Result<()>;

    /// Target queue for this task type; `None` routes recurring tasks to
    /// the recurring queue and everything else to the default queue.
    fn queue(&self) -> Option<&str> {
        None
    }

    /// Per-execution wall-clock limit. Exceeding it fails the task with a
    /// timeout exception; no retries follow.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn on_started(&self, _task_id: Uuid) {}

    async fn on_completed(&self, _task_id: Uuid) {}

    /// Called once, after retries are exhausted.
    async fn on_error(&self, _task_id: Uuid, _error: &str, _message: &str) {}

    /// Called before each retry attempt.
    async fn on_retry(&self, _task_id: Uuid, _attempt: u32, _error: &str) {}
}

/// Per-execution context handed to the handler.
#[derive(Clone)]
pub struct TaskContext {
    task_id: Uuid,
    attempt: u32,
    token: CancellationToken,
    logger: TaskLogger,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: Uuid,
        attempt: u32,
        token: CancellationToken,
        logger: TaskLogger,
    ) -> Self {
        Self { task_id, attempt, token, logger }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// 1-based attempt number; 1 is the initial attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Composite cancellation signal: fires on caller cancellation and on
    /// engine shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Logger whose lines are captured into the task's execution log.
    pub fn logger(&self) -> &TaskLogger {
        &self.logger
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}
