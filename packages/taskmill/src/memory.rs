//! Reference in-memory store.
//!
//! Honors the full storage contract, including the atomicity rules: the
//! status/run bookkeeping runs under a per-id async mutex, which is the
//! in-memory equivalent of the relational adapter's single-round-trip
//! stored procedure. Useful on its own for tests and for hosts that accept
//! losing queued work on restart.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::model::{AuditLevel, QueuedTask, RunsAudit, StatusAudit, TaskExecutionLog, TaskStatus};
use crate::queue::DEFAULT_QUEUE;
use crate::store::{skipped_occurrences_summary, TaskStore};

struct TaskRecord {
    task: QueuedTask,
    status_audits: Vec<StatusAudit>,
    runs_audits: Vec<RunsAudit>,
    logs: Vec<TaskExecutionLog>,
}

/// DashMap-backed store; cheap to clone via `Arc`.
pub struct InMemoryTaskStore {
    clock: Arc<dyn Clock>,
    rows: DashMap<Uuid, TaskRecord>,
    keys: DashMap<String, Uuid>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    audit_seq: AtomicI64,
    max_logs_per_task: Option<usize>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: DashMap::new(),
            keys: DashMap::new(),
            locks: DashMap::new(),
            audit_seq: AtomicI64::new(1),
            max_logs_per_task: None,
        }
    }

    /// Bound persisted execution logs per task.
    pub fn with_max_logs_per_task(mut self, cap: usize) -> Self {
        self.max_logs_per_task = Some(cap);
        self
    }

    pub fn task_count(&self) -> usize {
        self.rows.len()
    }

    fn next_audit_id(&self) -> i64 {
        self.audit_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn row_guard(&self, id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn persist(&self, task: QueuedTask) -> Result<Uuid, StoreError> {
        if let Some(key) = &task.task_key {
            match self.keys.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(StoreError::DuplicateKey { key: key.clone() });
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(task.id);
                }
            }
        }

        let id = task.id;
        let mut record = TaskRecord {
            task,
            status_audits: Vec::new(),
            runs_audits: Vec::new(),
            logs: Vec::new(),
        };
        let status = record.task.status;
        let exception = record.task.exception.clone();
        if record.task.audit_level.records_status(status, exception.as_deref()) {
            record.status_audits.push(StatusAudit {
                id: self.next_audit_id(),
                queued_task_id: id,
                updated_at_utc: self.clock.now_utc(),
                new_status: status,
                exception,
            });
        }
        self.rows.insert(id, record);
        Ok(id)
    }

    async fn update_task(&self, task: QueuedTask) -> Result<(), StoreError> {
        let _guard = self.row_guard(task.id).await;
        let mut record = self
            .rows
            .get_mut(&task.id)
            .ok_or(StoreError::NotFound { id: task.id })?;

        let previous = &record.task;
        let mut updated = task;
        updated.created_at_utc = previous.created_at_utc;
        updated.current_run_count = previous.current_run_count;
        updated.last_execution_utc = previous.last_execution_utc;

        if previous.task_key != updated.task_key {
            if let Some(old) = &previous.task_key {
                self.keys.remove(old);
            }
            if let Some(new) = &updated.task_key {
                self.keys.insert(new.clone(), updated.id);
            }
        }
        record.task = updated;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueuedTask>, StoreError> {
        Ok(self.rows.get(&id).map(|r| r.task.clone()))
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<QueuedTask>, StoreError> {
        let Some(id) = self.keys.get(key).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn get_all(&self) -> Result<Vec<QueuedTask>, StoreError> {
        let mut all: Vec<QueuedTask> = self.rows.iter().map(|r| r.task.clone()).collect();
        all.sort_by_key(|t| t.created_at_utc);
        Ok(all)
    }

    async fn retrieve_pending(
        &self,
        queue: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<QueuedTask>, StoreError> {
        let mut pending: Vec<QueuedTask> = self
            .rows
            .iter()
            .filter(|r| r.task.status.is_pending())
            .filter(|r| match queue {
                Some(name) => r.task.queue_name.as_deref().unwrap_or(DEFAULT_QUEUE) == name,
                None => true,
            })
            .map(|r| r.task.clone())
            .collect();
        pending.sort_by_key(|t| t.created_at_utc);
        if let Some(limit) = limit {
            pending.truncate(limit);
        }
        Ok(pending)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        exception: Option<&str>,
        audit_level: AuditLevel,
        execution_time_ms: Option<f64>,
    ) -> Result<(), StoreError> {
        let _guard = self.row_guard(id).await;
        let now = self.clock.now_utc();
        let Some(mut record) = self.rows.get_mut(&id) else {
            warn!(task_id = %id, ?status, "status update for unknown task; ignoring");
            return Ok(());
        };

        record.task.status = status;
        record.task.exception = exception.map(str::to_owned);
        if let Some(ms) = execution_time_ms {
            record.task.execution_time_ms = Some(ms);
        }
        if status.sets_last_execution() {
            record.task.last_execution_utc = Some(now);
        }
        if audit_level.records_status(status, exception) {
            let audit_id = self.next_audit_id();
            record.status_audits.push(StatusAudit {
                id: audit_id,
                queued_task_id: id,
                updated_at_utc: now,
                new_status: status,
                exception: exception.map(str::to_owned),
            });
        }
        Ok(())
    }

    async fn update_current_run(
        &self,
        id: Uuid,
        execution_time_ms: f64,
        next_run_utc: Option<DateTime<Utc>>,
        audit_level: AuditLevel,
    ) -> Result<(), StoreError> {
        let _guard = self.row_guard(id).await;
        let now = self.clock.now_utc();
        let Some(mut record) = self.rows.get_mut(&id) else {
            warn!(task_id = %id, "run update for unknown task; ignoring");
            return Ok(());
        };

        record.task.current_run_count = Some(record.task.current_run_count.unwrap_or(0) + 1);
        record.task.execution_time_ms = Some(execution_time_ms);
        record.task.next_run_utc = next_run_utc;

        let outcome = record.task.status;
        if audit_level.records_run(outcome) {
            let audit_id = self.next_audit_id();
            let exception = record.task.exception.clone();
            let run_until = record.task.run_until;
            record.runs_audits.push(RunsAudit {
                id: audit_id,
                queued_task_id: id,
                executed_at: now,
                status: outcome,
                exception,
                run_until,
                execution_time_ms: Some(execution_time_ms),
            });
        }
        Ok(())
    }

    async fn record_skipped_occurrences(
        &self,
        id: Uuid,
        occurrences: &[DateTime<Utc>],
    ) -> Result<(), StoreError> {
        if occurrences.is_empty() {
            return Ok(());
        }
        let _guard = self.row_guard(id).await;
        let now = self.clock.now_utc();
        let Some(mut record) = self.rows.get_mut(&id) else {
            warn!(task_id = %id, "skip record for unknown task; ignoring");
            return Ok(());
        };
        let audit_id = self.next_audit_id();
        let run_until = record.task.run_until;
        record.runs_audits.push(RunsAudit {
            id: audit_id,
            queued_task_id: id,
            executed_at: now,
            status: TaskStatus::Completed,
            exception: Some(skipped_occurrences_summary(occurrences)),
            run_until,
            execution_time_ms: None,
        });
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.row_guard(id).await;
        if let Some((_, record)) = self.rows.remove(&id) {
            if let Some(key) = &record.task.task_key {
                self.keys.remove(key);
            }
        }
        self.locks.remove(&id);
        Ok(())
    }

    async fn append_execution_logs(
        &self,
        id: Uuid,
        mut logs: Vec<TaskExecutionLog>,
    ) -> Result<(), StoreError> {
        if logs.is_empty() {
            return Ok(());
        }
        let _guard = self.row_guard(id).await;
        let Some(mut record) = self.rows.get_mut(&id) else {
            // Logs cascade from their parent; without a row they have no home.
            return Ok(());
        };
        if let Some(cap) = self.max_logs_per_task {
            let room = cap.saturating_sub(record.logs.len());
            logs.truncate(room);
        }
        record.logs.extend(logs);
        Ok(())
    }

    async fn get_execution_logs(&self, id: Uuid) -> Result<Vec<TaskExecutionLog>, StoreError> {
        let mut logs = self
            .rows
            .get(&id)
            .map(|r| r.logs.clone())
            .unwrap_or_default();
        logs.sort_by_key(|l| l.sequence_number);
        Ok(logs)
    }

    async fn get_status_audits(&self, id: Uuid) -> Result<Vec<StatusAudit>, StoreError> {
        Ok(self
            .rows
            .get(&id)
            .map(|r| r.status_audits.clone())
            .unwrap_or_default())
    }

    async fn get_runs_audits(&self, id: Uuid) -> Result<Vec<RunsAudit>, StoreError> {
        Ok(self
            .rows
            .get(&id)
            .map(|r| r.runs_audits.clone())
            .unwrap_or_default())
    }
}
