//! Captured per-task execution logs.
//!
//! Handlers receive a [`TaskLogger`] through their context. Lines are
//! buffered in memory during the run, forwarded to `tracing` as they arrive,
//! and flushed to storage in one batch after the run completes. A minimum
//! level and a per-task cap bound what gets persisted; `tracing` output is
//! never filtered here - that is the subscriber's job.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{LogLevel, TaskExecutionLog};

/// Persistence policy for captured execution logs.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// When false, nothing is buffered or persisted.
    pub enabled: bool,
    /// Lines below this level are not persisted.
    pub min_level: LogLevel,
    /// Hard cap on persisted lines per task; excess lines are dropped.
    pub max_logs_per_task: Option<usize>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            min_level: LogLevel::Info,
            max_logs_per_task: None,
        }
    }
}

impl LogOptions {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }
}

/// Cheaply cloneable logger bound to one task execution.
#[derive(Clone)]
pub struct TaskLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    task_id: Uuid,
    options: LogOptions,
    entries: Mutex<Vec<TaskExecutionLog>>,
    sequence: AtomicI32,
}

impl TaskLogger {
    pub fn new(task_id: Uuid, options: LogOptions) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                task_id,
                options,
                entries: Mutex::new(Vec::new()),
                sequence: AtomicI32::new(0),
            }),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.inner.task_id
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, message.into(), None);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into(), None);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into(), None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message.into(), None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into(), None);
    }

    /// Record an error line together with exception detail.
    pub fn error_with(&self, message: impl Into<String>, details: impl Into<String>) {
        self.log(LogLevel::Error, message.into(), Some(details.into()));
    }

    pub fn log(&self, level: LogLevel, message: String, details: Option<String>) {
        self.forward_to_tracing(level, &message);
        if !self.inner.options.enabled || level < self.inner.options.min_level {
            return;
        }

        let mut entries = self.inner.entries.lock().expect("logger poisoned");
        if let Some(cap) = self.inner.options.max_logs_per_task {
            if entries.len() >= cap {
                return;
            }
        }
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        entries.push(TaskExecutionLog {
            id: Uuid::new_v4(),
            task_id: self.inner.task_id,
            timestamp_utc: Utc::now(),
            level,
            message,
            exception_details: details,
            sequence_number: sequence,
        });
    }

    /// Take every buffered line, leaving the buffer empty.
    pub fn drain(&self) -> Vec<TaskExecutionLog> {
        std::mem::take(&mut *self.inner.entries.lock().expect("logger poisoned"))
    }

    /// Stamp buffered timestamps from an externally supplied instant.
    /// Storage-bound timestamps always carry a zero offset by construction.
    pub fn stamp(&self, now: DateTime<Utc>) {
        let mut entries = self.inner.entries.lock().expect("logger poisoned");
        for entry in entries.iter_mut() {
            entry.timestamp_utc = now;
        }
    }

    fn forward_to_tracing(&self, level: LogLevel, message: &str) {
        let task_id = self.inner.task_id;
        match level {
            LogLevel::Trace => tracing::trace!(task_id = %task_id, "{message}"),
            LogLevel::Debug => tracing::debug!(task_id = %task_id, "{message}"),
            LogLevel::Info => tracing::info!(task_id = %task_id, "{message}"),
            LogLevel::Warn => tracing::warn!(task_id = %task_id, "{message}"),
            LogLevel::Error => tracing::error!(task_id = %task_id, "{message}"),
        }
    }
}

impl std::fmt::Debug for TaskLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLogger")
            .field("task_id", &self.inner.task_id)
            .finish_non_exhaustive()
    }
}
