//! Durable task model: the [`QueuedTask`] aggregate and its audit children.
//!
//! `QueuedTask` is the sole aggregate root. Audit rows ([`StatusAudit`],
//! [`RunsAudit`], [`TaskExecutionLog`]) belong to exactly one task and hold
//! the parent id only - there are no back-pointers from parent to child in
//! the entity itself; stores own the child collections and cascade them on
//! removal.
//!
//! All timestamps are `DateTime<Utc>`: the engine never persists a local
//! offset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Upper bound on caller-supplied idempotency keys.
pub const MAX_TASK_KEY_LEN: usize = 200;

/// Upper bound on fully-qualified type and handler identifiers.
pub const MAX_TYPE_NAME_LEN: usize = 500;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle state of a queued task.
///
/// ```text
/// Created ──► WaitingQueue ──► Queued ──► InProgress ──► Completed
///   │                            ▲                   \─► Failed
///   └────────────────────────────┘ (immediate)       \─► Cancelled
///                                                    \─► ServiceStopped
/// Completed (recurring) ──► WaitingQueue (next occurrence)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting in the scheduler for a future fire time.
    WaitingQueue,
    /// Sitting in a worker queue, waiting to be picked up.
    Queued,
    /// Currently executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Cancelled by the caller, before or during execution.
    Cancelled,
    /// Finished with an error after exhausting retries.
    Failed,
    /// Interrupted by engine shutdown; resumes on the next start.
    ServiceStopped,
    /// Created but not yet routed anywhere.
    Pending,
}

impl TaskStatus {
    /// Statuses that end a task's life (a recurring task re-enters
    /// `WaitingQueue` from `Completed`, but each occurrence ends here).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::ServiceStopped
        )
    }

    /// Whether a transition into this status stamps `last_execution_utc`.
    pub fn sets_last_execution(self) -> bool {
        !matches!(
            self,
            TaskStatus::Queued | TaskStatus::InProgress | TaskStatus::Cancelled | TaskStatus::Pending
        )
    }

    /// Statuses with work still ahead of them. These are the rows recovery
    /// re-drives on startup; `ServiceStopped` is included because shutdown
    /// leaves interrupted tasks for the next start.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            TaskStatus::WaitingQueue
                | TaskStatus::Queued
                | TaskStatus::InProgress
                | TaskStatus::Pending
                | TaskStatus::ServiceStopped
        )
    }

    /// Stable string form, used by relational stores (enum-as-string).
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::WaitingQueue => "WaitingQueue",
            TaskStatus::Queued => "Queued",
            TaskStatus::InProgress => "InProgress",
            TaskStatus::Completed => "Completed",
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::Failed => "Failed",
            TaskStatus::ServiceStopped => "ServiceStopped",
            TaskStatus::Pending => "Pending",
        }
    }

    /// Parse the stable string form back. Returns `None` for unknown input.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "WaitingQueue" => TaskStatus::WaitingQueue,
            "Queued" => TaskStatus::Queued,
            "InProgress" => TaskStatus::InProgress,
            "Completed" => TaskStatus::Completed,
            "Cancelled" => TaskStatus::Cancelled,
            "Failed" => TaskStatus::Failed,
            "ServiceStopped" => TaskStatus::ServiceStopped,
            "Pending" => TaskStatus::Pending,
            _ => return None,
        })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Audit policy
// =============================================================================

/// How much audit history a task keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuditLevel {
    /// Every execution-lifecycle transition is recorded.
    #[default]
    Full,
    /// Only failures and transitions carrying a real exception.
    Minimal,
    /// Same predicate as `Minimal`.
    ErrorsOnly,
    /// Never write audits.
    None,
}

impl AuditLevel {
    /// Whether a transition to `new_status` with `exception` produces a
    /// [`StatusAudit`] row.
    ///
    /// `WaitingQueue` is scheduling bookkeeping, not execution lifecycle, so
    /// it is never audited - the audit trail of one occurrence reads
    /// `Queued, InProgress, Completed`. A `ServiceStopped` transition whose
    /// exception is cancellation-shaped is an expected shutdown and is
    /// suppressed under `Minimal`/`ErrorsOnly`.
    pub fn records_status(self, new_status: TaskStatus, exception: Option<&str>) -> bool {
        match self {
            AuditLevel::None => false,
            AuditLevel::Full => new_status != TaskStatus::WaitingQueue,
            AuditLevel::Minimal | AuditLevel::ErrorsOnly => {
                if new_status == TaskStatus::Failed {
                    return true;
                }
                match exception {
                    Some(e) if !e.is_empty() => {
                        !(new_status == TaskStatus::ServiceStopped && is_cancellation_shaped(e))
                    }
                    _ => false,
                }
            }
        }
    }

    /// Whether a recurring execution with the given outcome produces a
    /// [`RunsAudit`] row.
    pub fn records_run(self, outcome: TaskStatus) -> bool {
        let failed_shape = matches!(
            outcome,
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::ServiceStopped
        );
        match self {
            AuditLevel::Full | AuditLevel::Minimal => true,
            AuditLevel::ErrorsOnly => failed_shape,
            AuditLevel::None => false,
        }
    }

    /// Integer form used by relational stores.
    pub fn as_i32(self) -> i32 {
        match self {
            AuditLevel::Full => 0,
            AuditLevel::Minimal => 1,
            AuditLevel::ErrorsOnly => 2,
            AuditLevel::None => 3,
        }
    }

    /// Inverse of [`AuditLevel::as_i32`]; unknown values fall back to `Full`.
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => AuditLevel::Minimal,
            2 => AuditLevel::ErrorsOnly,
            3 => AuditLevel::None,
            _ => AuditLevel::Full,
        }
    }
}

/// True when an exception string looks like a cooperative cancellation
/// rather than a real failure.
pub(crate) fn is_cancellation_shaped(exception: &str) -> bool {
    exception.contains("OperationCanceled")
}

// =============================================================================
// Aggregate root
// =============================================================================

/// The durable representation of one dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Primary identity.
    pub id: Uuid,
    /// Optional idempotency key; unique across all live rows when present.
    pub task_key: Option<String>,
    /// Fully-qualified payload type identifier; selects the codec on recovery.
    pub task_type: String,
    /// Fully-qualified handler identifier.
    pub handler: String,
    /// JSON-encoded payload.
    pub request: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Target queue; `None` routes to the default queue.
    pub queue_name: Option<String>,
    /// Audit policy for this task.
    pub audit_level: AuditLevel,
    /// Fast filter for recurring rows.
    pub is_recurring: bool,
    /// JSON-encoded recurring rule, when `is_recurring`.
    pub recurring_task: Option<String>,
    /// Human-readable summary of the recurring rule, for operators.
    pub recurring_info: Option<String>,
    /// Immutable creation time.
    pub created_at_utc: DateTime<Utc>,
    /// Next fire time for delayed / specific-time tasks.
    pub scheduled_execution_utc: Option<DateTime<Utc>>,
    /// Next fire time for recurring tasks.
    pub next_run_utc: Option<DateTime<Utc>>,
    /// Stamped on transitions that end an occurrence (see
    /// [`TaskStatus::sets_last_execution`]).
    pub last_execution_utc: Option<DateTime<Utc>>,
    /// Number of recurring executions completed so far.
    pub current_run_count: Option<i32>,
    /// Hard cap on recurring executions.
    pub max_runs: Option<i32>,
    /// Hard time cap on recurring executions.
    pub run_until: Option<DateTime<Utc>>,
    /// Detail of the most recent failure.
    pub exception: Option<String>,
    /// Wall time of the last run, in milliseconds.
    pub execution_time_ms: Option<f64>,
}

impl QueuedTask {
    /// The next wall-clock instant this task is due, if any.
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_run_utc.or(self.scheduled_execution_utc)
    }
}

// =============================================================================
// Audit children
// =============================================================================

/// One row per audited status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusAudit {
    pub id: i64,
    pub queued_task_id: Uuid,
    pub updated_at_utc: DateTime<Utc>,
    pub new_status: TaskStatus,
    pub exception: Option<String>,
}

/// One row per recurring execution attempt (not per retry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsAudit {
    pub id: i64,
    pub queued_task_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub exception: Option<String>,
    pub run_until: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<f64>,
}

/// Severity of a captured execution log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "Trace",
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warn => "Warn",
            LogLevel::Error => "Error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured application-log line emitted while a task was executing.
///
/// Chronological order within a task is defined by `sequence_number`, not by
/// the timestamp (several lines can share a millisecond).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionLog {
    pub id: Uuid,
    pub task_id: Uuid,
    pub timestamp_utc: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub exception_details: Option<String>,
    pub sequence_number: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            TaskStatus::WaitingQueue,
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
            TaskStatus::Failed,
            TaskStatus::ServiceStopped,
            TaskStatus::Pending,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("NotAStatus"), None);
    }

    #[test]
    fn test_last_execution_rule() {
        assert!(TaskStatus::Completed.sets_last_execution());
        assert!(TaskStatus::Failed.sets_last_execution());
        assert!(TaskStatus::ServiceStopped.sets_last_execution());
        assert!(TaskStatus::WaitingQueue.sets_last_execution());
        assert!(!TaskStatus::Queued.sets_last_execution());
        assert!(!TaskStatus::InProgress.sets_last_execution());
        assert!(!TaskStatus::Cancelled.sets_last_execution());
        assert!(!TaskStatus::Pending.sets_last_execution());
    }

    #[test]
    fn test_full_audits_everything_but_waiting_queue() {
        assert!(AuditLevel::Full.records_status(TaskStatus::Queued, None));
        assert!(AuditLevel::Full.records_status(TaskStatus::InProgress, None));
        assert!(AuditLevel::Full.records_status(TaskStatus::Completed, None));
        assert!(!AuditLevel::Full.records_status(TaskStatus::WaitingQueue, None));
    }

    #[test]
    fn test_minimal_audits_failures_only() {
        assert!(AuditLevel::Minimal.records_status(TaskStatus::Failed, None));
        assert!(AuditLevel::Minimal.records_status(TaskStatus::Failed, Some("boom")));
        assert!(!AuditLevel::Minimal.records_status(TaskStatus::Completed, None));
        assert!(!AuditLevel::Minimal.records_status(TaskStatus::InProgress, None));
        // Any transition carrying a real exception is recorded.
        assert!(AuditLevel::Minimal.records_status(TaskStatus::Cancelled, Some("boom")));
        // Empty exception strings do not count.
        assert!(!AuditLevel::Minimal.records_status(TaskStatus::Cancelled, Some("")));
    }

    #[test]
    fn test_expected_shutdown_is_not_an_error() {
        let shutdown_exc = "OperationCanceledException: the service is stopping";
        assert!(!AuditLevel::Minimal.records_status(TaskStatus::ServiceStopped, Some(shutdown_exc)));
        assert!(!AuditLevel::ErrorsOnly.records_status(TaskStatus::ServiceStopped, Some(shutdown_exc)));
        // A ServiceStopped transition with a genuine error is still recorded.
        assert!(AuditLevel::Minimal.records_status(TaskStatus::ServiceStopped, Some("disk on fire")));
        // Full keeps it either way.
        assert!(AuditLevel::Full.records_status(TaskStatus::ServiceStopped, Some(shutdown_exc)));
    }

    #[test]
    fn test_none_never_audits() {
        assert!(!AuditLevel::None.records_status(TaskStatus::Failed, Some("boom")));
        assert!(!AuditLevel::None.records_run(TaskStatus::Failed));
    }

    #[test]
    fn test_runs_audit_policy() {
        assert!(AuditLevel::Full.records_run(TaskStatus::Completed));
        assert!(AuditLevel::Minimal.records_run(TaskStatus::Completed));
        assert!(!AuditLevel::ErrorsOnly.records_run(TaskStatus::Completed));
        assert!(AuditLevel::ErrorsOnly.records_run(TaskStatus::Failed));
        assert!(AuditLevel::ErrorsOnly.records_run(TaskStatus::Cancelled));
    }

    #[test]
    fn test_audit_level_i32_round_trip() {
        for level in [
            AuditLevel::Full,
            AuditLevel::Minimal,
            AuditLevel::ErrorsOnly,
            AuditLevel::None,
        ] {
            assert_eq!(AuditLevel::from_i32(level.as_i32()), level);
        }
        assert_eq!(AuditLevel::from_i32(99), AuditLevel::Full);
    }
}
