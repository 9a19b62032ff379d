//! # Taskmill
//!
//! A durable, in-process background task engine: callers submit typed
//! payloads with a matching handler, and the engine persists, schedules,
//! dispatches, executes (with retries and timeouts), and audits each task -
//! surviving process restarts.
//!
//! Three dispatch shapes: *immediate*, *delayed / specific time*, and
//! *recurring* (interval or cron, with skip/catch-up semantics).
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher ──► persist(Queued | WaitingQueue)
//!     │
//!     ├─ immediate ────────────────────────────► Queue ──► Worker
//!     │                                            ▲          │
//!     └─ delayed / recurring ──► Scheduler ────────┘          │
//!                                    ▲                        ▼
//!                                    │               Completed / Failed
//!                                    └── recurring next run ──┘
//! ```
//!
//! Queues are independent bounded channels, each with its own worker pool;
//! the scheduler is a min-heap drained by tick fibres (optionally sharded).
//! Everything observable lives in the storage contract, so a fresh host
//! reading the same store resumes exactly where the last one stopped.
//!
//! ## Example
//!
//! ```ignore
//! use taskmill::{Engine, InMemoryTaskStore, RecurringSpec, TaskContext, TaskHandler};
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct SendReport {
//!     recipient: String,
//! }
//!
//! struct SendReportHandler;
//!
//! #[taskmill::async_trait]
//! impl TaskHandler for SendReportHandler {
//!     type Task = SendReport;
//!
//!     async fn handle(&self, task: SendReport, ctx: &TaskContext) -> anyhow::Result<()> {
//!         ctx.logger().info(format!("reporting to {}", task.recipient));
//!         Ok(())
//!     }
//! }
//!
//! let handle = Engine::builder(std::sync::Arc::new(InMemoryTaskStore::new()))
//!     .register::<SendReportHandler, _>(|| SendReportHandler)
//!     .build()
//!     .start()
//!     .await;
//!
//! // Run now.
//! handle.dispatcher().dispatch(SendReport { recipient: "ops".into() }).await?;
//!
//! // Run every morning at most 30 times.
//! handle.dispatcher()
//!     .dispatch_recurring(
//!         SendReport { recipient: "ops".into() },
//!         RecurringSpec::cron("0 6 * * *").with_max_runs(30),
//!     )
//!     .await?;
//!
//! handle.shutdown(std::time::Duration::from_secs(10)).await;
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once**: every dispatched task is observed by a worker at
//!   least once per occurrence; idempotent registration via task keys keeps
//!   re-submission safe.
//! - **Drift-free recurrence**: the next occurrence is computed from the
//!   prior *scheduled* time, never from wall-clock now, so handler latency
//!   does not accumulate.
//! - **Restart-safe**: pending rows are re-driven on startup; missed
//!   recurring occurrences are skipped and recorded, never replayed in a
//!   burst.

mod cancellation;
mod clock;
mod dispatch;
mod engine;
mod error;
mod executor;
mod logging;
mod memory;
mod model;
mod queue;
mod recurring;
mod registry;
mod retry;
mod scheduler;
mod store;
mod task;
mod worker;


pub use cancellation::{Blacklist, CancellationRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchOptions, Dispatcher, Schedule};
pub use engine::{Engine, EngineBuilder, EngineHandle};
pub use error::{AggregateError, DispatchError, ExecutionError, StoreError};
pub use executor::PayloadDecodeError;
pub use logging::{LogOptions, TaskLogger};
pub use memory::InMemoryTaskStore;
pub use model::{
    AuditLevel, LogLevel, QueuedTask, RunsAudit, StatusAudit, TaskExecutionLog, TaskStatus,
    MAX_TASK_KEY_LEN, MAX_TYPE_NAME_LEN,
};
pub use queue::{QueueManager, QueueOptions, WorkerQueue, DEFAULT_QUEUE, RECURRING_QUEUE};
pub use recurring::{
    DayInterval, MonthInterval, NextRunPlan, RecurringSpec, UnitInterval, WeekInterval,
    DEFAULT_MAX_ITERATIONS,
};
pub use registry::{HandlerEntry, HandlerRegistry};
pub use retry::{RetryDecider, RetryPolicy};
pub use scheduler::{Scheduler, DEFAULT_TICK};
pub use store::{skipped_occurrences_summary, TaskStore};
pub use task::{TaskContext, TaskHandler, TaskPayload};

// Re-export commonly used external types.
pub use async_trait::async_trait;
