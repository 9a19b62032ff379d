//! Structured error types for the engine surface.
//!
//! The boundary rule mirrors the rest of the codebase: `anyhow::Error` is
//! internal transport (ergonomic inside handlers), while everything that
//! crosses the public API or gets persisted is a structured, pattern-matchable
//! enum.
//!
//! Persisted exception strings carry stable, distinguishable markers:
//! a timed-out run contains `"TimeoutException"`, a cooperative cancellation
//! contains `"OperationCanceledException"`. Audit policy and monitoring rely
//! on those substrings, so [`ExecutionError`]'s `Display` output is part of
//! the storage contract.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// Storage
// =============================================================================

/// Failure modes of the storage contract.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A live row already holds this idempotency key.
    #[error("task key {key:?} is already registered")]
    DuplicateKey { key: String },

    /// The referenced task does not exist.
    #[error("task {id} not found")]
    NotFound { id: Uuid },

    /// The backend itself failed (I/O, SQL, connection).
    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Backend(err.into())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Failure modes of [`crate::dispatch::Dispatcher`] surfaced synchronously
/// to the caller.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler was registered for the dispatched task type.
    #[error("no handler registered for task type {type_name}")]
    HandlerNotRegistered { type_name: String },

    /// The payload could not be serialized.
    #[error("failed to serialize payload for {type_name}: {source}")]
    Serialization {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },

    /// The recurring rule is invalid (no interval, cron parse failure,
    /// unsupported syntax). Always surfaced at dispatch, never at run time.
    #[error("invalid recurring rule: {reason}")]
    InvalidRecurrence { reason: String },

    /// A field exceeded its storage bound.
    #[error("{field} exceeds the maximum length of {max}")]
    FieldTooLong { field: &'static str, max: usize },

    /// Persistence failed and the task demanded durability.
    #[error("unable to persist task {id}")]
    Persistence {
        id: Uuid,
        #[source]
        source: StoreError,
    },

    /// The engine is shutting down and no longer accepts work.
    #[error("the engine is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Execution
// =============================================================================

/// The final classified outcome of a failed or interrupted execution.
///
/// The `Display` form is what gets persisted into `QueuedTask::exception`,
/// so each variant carries its distinguishing marker in the message.
#[derive(Debug)]
pub enum ExecutionError {
    /// The handler exceeded its configured timeout.
    Timeout { limit: Duration },
    /// The caller cancelled the task while it was running.
    Cancelled,
    /// Engine shutdown interrupted the task.
    Stopped,
    /// The handler failed on every attempt; one entry per attempt.
    Handler(AggregateError),
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::Timeout { limit } => {
                write!(f, "TimeoutException: handler exceeded its timeout of {limit:?}")
            }
            ExecutionError::Cancelled => {
                write!(f, "OperationCanceledException: the task was cancelled")
            }
            ExecutionError::Stopped => {
                write!(f, "OperationCanceledException: the service is stopping")
            }
            ExecutionError::Handler(agg) => agg.fmt(f),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Every attempt's error, collected by the retry loop and persisted as one
/// exception string when retries are exhausted.
#[derive(Debug, Default)]
pub struct AggregateError {
    attempts: Vec<String>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: &anyhow::Error) {
        self.attempts.push(format!("{error:#}"));
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Error message of the most recent attempt, if any.
    pub fn last(&self) -> Option<&str> {
        self.attempts.last().map(String::as_str)
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AggregateException: {} attempt(s) failed", self.attempts.len())?;
        for (i, msg) in self.attempts.iter().enumerate() {
            write!(f, " [{}] {}", i + 1, msg)?;
        }
        Ok(())
    }
}
