//! The durable storage contract.
//!
//! Implementations persist [`QueuedTask`] rows, their audit children, and
//! captured execution logs. The contract is behavioral, not SQL-shaped: the
//! reference in-memory store and the relational adapter honor the same
//! atomicity rules.
//!
//! # Concurrency contract
//!
//! [`TaskStore::set_status`] and [`TaskStore::update_current_run`] are
//! serializable with respect to the same task id. Tasks are single-writer
//! after dispatch, so implementations use row-level locking (a per-id mutex
//! in memory, row locks in SQL) - never optimistic concurrency tokens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{AuditLevel, QueuedTask, RunsAudit, StatusAudit, TaskExecutionLog, TaskStatus};

/// Durable CRUD plus the atomic status/run bookkeeping the worker relies on.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Insert a new task row, writing the initial status audit per policy.
    ///
    /// Fails with [`StoreError::DuplicateKey`] when the task carries a key
    /// that another live row already holds; the dispatcher resolves key
    /// collisions before persisting, so hitting this means a concurrent
    /// dispatch won the race.
    async fn persist(&self, task: QueuedTask) -> Result<Uuid, StoreError>;

    /// Full-row update. `created_at_utc`, `current_run_count`, and
    /// `last_execution_utc` are preserved from the stored row - callers
    /// cannot rewrite history through this path.
    async fn update_task(&self, task: QueuedTask) -> Result<(), StoreError>;

    /// Snapshot of one row.
    async fn get(&self, id: Uuid) -> Result<Option<QueuedTask>, StoreError>;

    /// Snapshot of the row holding the given idempotency key, if any.
    async fn get_by_key(&self, key: &str) -> Result<Option<QueuedTask>, StoreError>;

    /// Snapshot of every row.
    async fn get_all(&self) -> Result<Vec<QueuedTask>, StoreError>;

    /// Snapshot of rows matching a predicate.
    async fn find(
        &self,
        predicate: &(dyn for<'a> Fn(&'a QueuedTask) -> bool + Send + Sync),
    ) -> Result<Vec<QueuedTask>, StoreError> {
        let all = self.get_all().await?;
        let mut matched = Vec::new();
        for t in all {
            if predicate(&t) {
                matched.push(t);
            }
        }
        Ok(matched)
    }

    /// Rows with work still ahead of them (see [`TaskStatus::is_pending`]),
    /// optionally restricted to one queue and capped in count.
    async fn retrieve_pending(
        &self,
        queue: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<QueuedTask>, StoreError>;

    /// Atomically update the row's status and conditionally insert one
    /// [`StatusAudit`], in a single round-trip.
    ///
    /// Stamps `last_execution_utc` per [`TaskStatus::sets_last_execution`]
    /// and records the run's wall time when one is supplied. A missing row
    /// is a no-op that logs a warning, not an error - the engine runs
    /// unpersisted tasks best-effort.
    async fn set_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        exception: Option<&str>,
        audit_level: AuditLevel,
        execution_time_ms: Option<f64>,
    ) -> Result<(), StoreError>;

    /// Atomically close out one recurring execution: increment
    /// `current_run_count`, record the wall time, set the next fire time,
    /// and append one [`RunsAudit`] row (per policy) describing the outcome
    /// the row currently holds.
    ///
    /// The status audit for the outcome was already written by the
    /// `set_status` call that precedes this one; none is written here.
    async fn update_current_run(
        &self,
        id: Uuid,
        execution_time_ms: f64,
        next_run_utc: Option<DateTime<Utc>>,
        audit_level: AuditLevel,
    ) -> Result<(), StoreError>;

    /// Record a batch of missed occurrences as one `Completed` run-audit row
    /// whose exception text enumerates them.
    async fn record_skipped_occurrences(
        &self,
        id: Uuid,
        occurrences: &[DateTime<Utc>],
    ) -> Result<(), StoreError>;

    /// Remove a row and cascade its audits and logs.
    async fn remove(&self, id: Uuid) -> Result<(), StoreError>;

    /// Append captured execution log lines, honoring the per-task bound
    /// when one is configured.
    async fn append_execution_logs(
        &self,
        id: Uuid,
        logs: Vec<TaskExecutionLog>,
    ) -> Result<(), StoreError>;

    /// Captured log lines in `sequence_number` order.
    async fn get_execution_logs(&self, id: Uuid) -> Result<Vec<TaskExecutionLog>, StoreError>;

    /// Status audit trail in insertion order.
    async fn get_status_audits(&self, id: Uuid) -> Result<Vec<StatusAudit>, StoreError>;

    /// Run audit trail in insertion order.
    async fn get_runs_audits(&self, id: Uuid) -> Result<Vec<RunsAudit>, StoreError>;
}

/// Render the skipped-occurrence summary persisted by
/// [`TaskStore::record_skipped_occurrences`]. Shared by every backend so the
/// text stays grep-stable.
pub fn skipped_occurrences_summary(occurrences: &[DateTime<Utc>]) -> String {
    let rendered: Vec<String> = occurrences.iter().map(|t| t.to_rfc3339()).collect();
    format!(
        "Skipped {} missed occurrence(s): {}",
        occurrences.len(),
        rendered.join(", ")
    )
}
