//! PostgreSQL implementation of the taskmill storage contract.
//!
//! # Features
//!
//! - Atomic status updates: row update + conditional audit insert in one
//!   round-trip (a data-modifying CTE, the SQL equivalent of the contract's
//!   stored procedure)
//! - Row-level locking through plain `UPDATE` statements; tasks are
//!   single-writer after dispatch, so no optimistic concurrency tokens
//! - Cascade deletes from the task row to audits and logs
//! - Configurable schema name; migrations propagate it
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE queued_tasks (
//!     id UUID PRIMARY KEY,
//!     created_at_utc TIMESTAMPTZ NOT NULL,
//!     last_execution_utc TIMESTAMPTZ,
//!     scheduled_execution_utc TIMESTAMPTZ,
//!     next_run_utc TIMESTAMPTZ,
//!     run_until TIMESTAMPTZ,
//!     task_type VARCHAR(500) NOT NULL,
//!     handler VARCHAR(500) NOT NULL DEFAULT '',
//!     request TEXT NOT NULL DEFAULT '',
//!     exception TEXT,
//!     status VARCHAR(15) NOT NULL,
//!     queue_name TEXT,
//!     task_key VARCHAR(200),
//!     audit_level INTEGER,
//!     is_recurring BOOLEAN NOT NULL DEFAULT FALSE,
//!     recurring_task TEXT,
//!     recurring_info TEXT,
//!     current_run_count INTEGER,
//!     max_runs INTEGER,
//!     execution_time_ms DOUBLE PRECISION
//! );
//!
//! CREATE TABLE status_audit (
//!     id BIGSERIAL PRIMARY KEY,
//!     queued_task_id UUID NOT NULL REFERENCES queued_tasks (id) ON DELETE CASCADE,
//!     updated_at_utc TIMESTAMPTZ NOT NULL,
//!     new_status VARCHAR(15) NOT NULL,
//!     exception TEXT
//! );
//!
//! CREATE TABLE runs_audit (
//!     id BIGSERIAL PRIMARY KEY,
//!     queued_task_id UUID NOT NULL REFERENCES queued_tasks (id) ON DELETE CASCADE,
//!     executed_at TIMESTAMPTZ NOT NULL,
//!     status VARCHAR(15) NOT NULL,
//!     exception TEXT,
//!     run_until TIMESTAMPTZ,
//!     execution_time_ms DOUBLE PRECISION
//! );
//!
//! CREATE TABLE task_execution_logs (
//!     id UUID PRIMARY KEY,
//!     task_id UUID NOT NULL REFERENCES queued_tasks (id) ON DELETE CASCADE,
//!     timestamp_utc TIMESTAMPTZ NOT NULL,
//!     level VARCHAR(20) NOT NULL,
//!     message VARCHAR(4000) NOT NULL,
//!     exception_details TEXT,
//!     sequence_number INTEGER NOT NULL
//! );
//! ```
//!
//! Every timestamp column is `TIMESTAMPTZ`; values are written and read as
//! UTC with a zero offset.
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskmill::Engine;
//! use taskmill_postgres::PgTaskStore;
//!
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! let store = PgTaskStore::new(pool).with_schema("jobs")?;
//! store.migrate().await?;
//!
//! let handle = Engine::builder(std::sync::Arc::new(store))
//!     .register::<MyHandler, _>(|| MyHandler)
//!     .build()
//!     .start()
//!     .await;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use taskmill::{
    skipped_occurrences_summary, AuditLevel, LogLevel, QueuedTask, RunsAudit, StatusAudit,
    StoreError, TaskExecutionLog, TaskStatus, TaskStore, DEFAULT_QUEUE,
};

const DEFAULT_SCHEMA: &str = "taskmill";

/// PostgreSQL task store.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
    schema: String,
    max_logs_per_task: Option<i64>,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: DEFAULT_SCHEMA.to_string(),
            max_logs_per_task: None,
        }
    }

    /// Use a different schema. The name must be a plain identifier; it is
    /// interpolated into DDL and queries.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Result<Self, StoreError> {
        let schema = schema.into();
        if !is_valid_identifier(&schema) {
            return Err(StoreError::backend(anyhow::anyhow!(
                "invalid schema name: {schema:?}"
            )));
        }
        self.schema = schema;
        Ok(self)
    }

    /// Bound persisted execution logs per task.
    pub fn with_max_logs_per_task(mut self, cap: usize) -> Self {
        self.max_logs_per_task = Some(cap as i64);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Create the schema, tables, and indexes when missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in migration_statements(&self.schema) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
        }
        Ok(())
    }

    fn table(&self, name: &str) -> String {
        format!("\"{}\".{name}", self.schema)
    }
}

/// DDL for the given schema, in execution order.
pub fn migration_statements(schema: &str) -> Vec<String> {
    let s = format!("\"{schema}\"");
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {s}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {s}.queued_tasks (
                id UUID PRIMARY KEY,
                created_at_utc TIMESTAMPTZ NOT NULL,
                last_execution_utc TIMESTAMPTZ,
                scheduled_execution_utc TIMESTAMPTZ,
                next_run_utc TIMESTAMPTZ,
                run_until TIMESTAMPTZ,
                task_type VARCHAR(500) NOT NULL,
                handler VARCHAR(500) NOT NULL DEFAULT '',
                request TEXT NOT NULL DEFAULT '',
                exception TEXT,
                status VARCHAR(15) NOT NULL,
                queue_name TEXT,
                task_key VARCHAR(200),
                audit_level INTEGER,
                is_recurring BOOLEAN NOT NULL DEFAULT FALSE,
                recurring_task TEXT,
                recurring_info TEXT,
                current_run_count INTEGER,
                max_runs INTEGER,
                execution_time_ms DOUBLE PRECISION
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_queued_tasks_status
                 ON {s}.queued_tasks (status)"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS ix_queued_tasks_task_key
                 ON {s}.queued_tasks (task_key) WHERE task_key IS NOT NULL"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {s}.status_audit (
                id BIGSERIAL PRIMARY KEY,
                queued_task_id UUID NOT NULL REFERENCES {s}.queued_tasks (id) ON DELETE CASCADE,
                updated_at_utc TIMESTAMPTZ NOT NULL,
                new_status VARCHAR(15) NOT NULL,
                exception TEXT
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_status_audit_queued_task_id
                 ON {s}.status_audit (queued_task_id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {s}.runs_audit (
                id BIGSERIAL PRIMARY KEY,
                queued_task_id UUID NOT NULL REFERENCES {s}.queued_tasks (id) ON DELETE CASCADE,
                executed_at TIMESTAMPTZ NOT NULL,
                status VARCHAR(15) NOT NULL,
                exception TEXT,
                run_until TIMESTAMPTZ,
                execution_time_ms DOUBLE PRECISION
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_runs_audit_queued_task_id
                 ON {s}.runs_audit (queued_task_id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {s}.task_execution_logs (
                id UUID PRIMARY KEY,
                task_id UUID NOT NULL REFERENCES {s}.queued_tasks (id) ON DELETE CASCADE,
                timestamp_utc TIMESTAMPTZ NOT NULL,
                level VARCHAR(20) NOT NULL,
                message VARCHAR(4000) NOT NULL,
                exception_details TEXT,
                sequence_number INTEGER NOT NULL
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_task_execution_logs_task_id_timestamp_utc
                 ON {s}.task_execution_logs (task_id, timestamp_utc)"
        ),
    ]
}

fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn task_from_row(row: &PgRow) -> Result<QueuedTask, StoreError> {
    let status_raw: String = row.try_get("status").map_err(StoreError::backend)?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
        StoreError::backend(anyhow::anyhow!("unknown status in store: {status_raw:?}"))
    })?;
    let audit_level: Option<i32> = row.try_get("audit_level").map_err(StoreError::backend)?;
    Ok(QueuedTask {
        id: row.try_get("id").map_err(StoreError::backend)?,
        task_key: row.try_get("task_key").map_err(StoreError::backend)?,
        task_type: row.try_get("task_type").map_err(StoreError::backend)?,
        handler: row.try_get("handler").map_err(StoreError::backend)?,
        request: row.try_get("request").map_err(StoreError::backend)?,
        status,
        queue_name: row.try_get("queue_name").map_err(StoreError::backend)?,
        audit_level: AuditLevel::from_i32(audit_level.unwrap_or(0)),
        is_recurring: row.try_get("is_recurring").map_err(StoreError::backend)?,
        recurring_task: row.try_get("recurring_task").map_err(StoreError::backend)?,
        recurring_info: row.try_get("recurring_info").map_err(StoreError::backend)?,
        created_at_utc: row.try_get("created_at_utc").map_err(StoreError::backend)?,
        scheduled_execution_utc: row
            .try_get("scheduled_execution_utc")
            .map_err(StoreError::backend)?,
        next_run_utc: row.try_get("next_run_utc").map_err(StoreError::backend)?,
        last_execution_utc: row
            .try_get("last_execution_utc")
            .map_err(StoreError::backend)?,
        current_run_count: row
            .try_get("current_run_count")
            .map_err(StoreError::backend)?,
        max_runs: row.try_get("max_runs").map_err(StoreError::backend)?,
        run_until: row.try_get("run_until").map_err(StoreError::backend)?,
        exception: row.try_get("exception").map_err(StoreError::backend)?,
        execution_time_ms: row
            .try_get("execution_time_ms")
            .map_err(StoreError::backend)?,
    })
}

fn log_level_from_str(raw: &str) -> LogLevel {
    match raw {
        "Trace" => LogLevel::Trace,
        "Debug" => LogLevel::Debug,
        "Warn" => LogLevel::Warn,
        "Error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn persist(&self, task: QueuedTask) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        let insert = format!(
            "INSERT INTO {} (id, created_at_utc, last_execution_utc, scheduled_execution_utc,
                             next_run_utc, run_until, task_type, handler, request, exception,
                             status, queue_name, task_key, audit_level, is_recurring,
                             recurring_task, recurring_info, current_run_count, max_runs,
                             execution_time_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                     $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
            self.table("queued_tasks")
        );
        let result = sqlx::query(&insert)
            .bind(task.id)
            .bind(task.created_at_utc)
            .bind(task.last_execution_utc)
            .bind(task.scheduled_execution_utc)
            .bind(task.next_run_utc)
            .bind(task.run_until)
            .bind(&task.task_type)
            .bind(&task.handler)
            .bind(&task.request)
            .bind(&task.exception)
            .bind(task.status.as_str())
            .bind(&task.queue_name)
            .bind(&task.task_key)
            .bind(task.audit_level.as_i32())
            .bind(task.is_recurring)
            .bind(&task.recurring_task)
            .bind(&task.recurring_info)
            .bind(task.current_run_count)
            .bind(task.max_runs)
            .bind(task.execution_time_ms)
            .execute(&mut *tx)
            .await;

        if let Err(err) = result {
            if is_unique_violation(&err) {
                if let Some(key) = task.task_key {
                    return Err(StoreError::DuplicateKey { key });
                }
            }
            return Err(StoreError::backend(err));
        }

        if task
            .audit_level
            .records_status(task.status, task.exception.as_deref())
        {
            let audit = format!(
                "INSERT INTO {} (queued_task_id, updated_at_utc, new_status, exception)
                 VALUES ($1, $2, $3, $4)",
                self.table("status_audit")
            );
            sqlx::query(&audit)
                .bind(task.id)
                .bind(task.created_at_utc)
                .bind(task.status.as_str())
                .bind(&task.exception)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        }

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(task.id)
    }

    async fn update_task(&self, task: QueuedTask) -> Result<(), StoreError> {
        // created_at_utc, current_run_count, and last_execution_utc are
        // deliberately absent from the SET list.
        let update = format!(
            "UPDATE {} SET
                 scheduled_execution_utc = $2,
                 next_run_utc = $3,
                 run_until = $4,
                 task_type = $5,
                 handler = $6,
                 request = $7,
                 exception = $8,
                 status = $9,
                 queue_name = $10,
                 task_key = $11,
                 audit_level = $12,
                 is_recurring = $13,
                 recurring_task = $14,
                 recurring_info = $15,
                 max_runs = $16
             WHERE id = $1",
            self.table("queued_tasks")
        );
        let result = sqlx::query(&update)
            .bind(task.id)
            .bind(task.scheduled_execution_utc)
            .bind(task.next_run_utc)
            .bind(task.run_until)
            .bind(&task.task_type)
            .bind(&task.handler)
            .bind(&task.request)
            .bind(&task.exception)
            .bind(task.status.as_str())
            .bind(&task.queue_name)
            .bind(&task.task_key)
            .bind(task.audit_level.as_i32())
            .bind(task.is_recurring)
            .bind(&task.recurring_task)
            .bind(&task.recurring_info)
            .bind(task.max_runs)
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id: task.id });
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueuedTask>, StoreError> {
        let select = format!("SELECT * FROM {} WHERE id = $1", self.table("queued_tasks"));
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<QueuedTask>, StoreError> {
        let select = format!(
            "SELECT * FROM {} WHERE task_key = $1",
            self.table("queued_tasks")
        );
        let row = sqlx::query(&select)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn get_all(&self) -> Result<Vec<QueuedTask>, StoreError> {
        let select = format!(
            "SELECT * FROM {} ORDER BY created_at_utc",
            self.table("queued_tasks")
        );
        let rows = sqlx::query(&select)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn retrieve_pending(
        &self,
        queue: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<QueuedTask>, StoreError> {
        let select = format!(
            "SELECT * FROM {}
              WHERE status IN ('WaitingQueue', 'Queued', 'InProgress', 'Pending', 'ServiceStopped')
                AND ($1::text IS NULL OR COALESCE(queue_name, $2) = $1)
              ORDER BY created_at_utc
              LIMIT $3",
            self.table("queued_tasks")
        );
        let rows = sqlx::query(&select)
            .bind(queue)
            .bind(DEFAULT_QUEUE)
            .bind(limit.map(|l| l as i64).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        exception: Option<&str>,
        audit_level: AuditLevel,
        execution_time_ms: Option<f64>,
    ) -> Result<(), StoreError> {
        // Row update and conditional audit insert in one round-trip; the
        // data-modifying CTE plays the role of the stored procedure.
        let statement = format!(
            "WITH updated AS (
                 UPDATE {tasks}
                    SET status = $2,
                        exception = $3,
                        execution_time_ms = COALESCE($4, execution_time_ms),
                        last_execution_utc = CASE WHEN $5 THEN $6 ELSE last_execution_utc END
                  WHERE id = $1
              RETURNING id
             )
             INSERT INTO {audit} (queued_task_id, updated_at_utc, new_status, exception)
             SELECT id, $6, $2, $3 FROM updated WHERE $7",
            tasks = self.table("queued_tasks"),
            audit = self.table("status_audit"),
        );
        let result = sqlx::query(&statement)
            .bind(id)
            .bind(status.as_str())
            .bind(exception)
            .bind(execution_time_ms)
            .bind(status.sets_last_execution())
            .bind(Utc::now())
            .bind(audit_level.records_status(status, exception))
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;

        // rows_affected counts audit inserts; zero means either the row is
        // missing or auditing was off for this transition.
        if result.rows_affected() == 0 {
            let exists = format!(
                "SELECT 1 FROM {} WHERE id = $1",
                self.table("queued_tasks")
            );
            let found = sqlx::query(&exists)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::backend)?;
            if found.is_none() {
                warn!(task_id = %id, ?status, "status update for unknown task; ignoring");
            }
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
        let always = matches!(audit_level, AuditLevel::Full | AuditLevel::Minimal);
        let errors_only = matches!(audit_level, AuditLevel::ErrorsOnly);
        let statement = format!(
            "WITH updated AS (
                 UPDATE {tasks}
                    SET current_run_count = COALESCE(current_run_count, 0) + 1,
                        execution_time_ms = $2,
                        next_run_utc = $3
                  WHERE id = $1
              RETURNING id, status, exception, run_until
             )
             INSERT INTO {audit} (queued_task_id, executed_at, status, exception, run_until, execution_time_ms)
             SELECT id, $4, status, exception, run_until, $2 FROM updated
              WHERE $5 OR ($6 AND status IN ('Failed', 'Cancelled', 'ServiceStopped'))",
            tasks = self.table("queued_tasks"),
            audit = self.table("runs_audit"),
        );
        sqlx::query(&statement)
            .bind(id)
            .bind(execution_time_ms)
            .bind(next_run_utc)
            .bind(Utc::now())
            .bind(always)
            .bind(errors_only)
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
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
        let statement = format!(
            "INSERT INTO {audit} (queued_task_id, executed_at, status, exception, run_until, execution_time_ms)
             SELECT id, $2, 'Completed', $3, run_until, NULL
               FROM {tasks} WHERE id = $1",
            tasks = self.table("queued_tasks"),
            audit = self.table("runs_audit"),
        );
        sqlx::query(&statement)
            .bind(id)
            .bind(Utc::now())
            .bind(skipped_occurrences_summary(occurrences))
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        let delete = format!("DELETE FROM {} WHERE id = $1", self.table("queued_tasks"));
        sqlx::query(&delete)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
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
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        if let Some(cap) = self.max_logs_per_task {
            let count_q = format!(
                "SELECT COUNT(*) FROM {} WHERE task_id = $1",
                self.table("task_execution_logs")
            );
            let existing: i64 = sqlx::query_scalar(&count_q)
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
            let room = (cap - existing).max(0) as usize;
            logs.truncate(room);
            if logs.is_empty() {
                return Ok(());
            }
        }

        let insert = format!(
            "INSERT INTO {} (id, task_id, timestamp_utc, level, message, exception_details, sequence_number)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table("task_execution_logs")
        );
        for log in &logs {
            sqlx::query(&insert)
                .bind(log.id)
                .bind(log.task_id)
                .bind(log.timestamp_utc)
                .bind(log.level.as_str())
                .bind(&log.message)
                .bind(&log.exception_details)
                .bind(log.sequence_number)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        }

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get_execution_logs(&self, id: Uuid) -> Result<Vec<TaskExecutionLog>, StoreError> {
        let select = format!(
            "SELECT * FROM {} WHERE task_id = $1 ORDER BY sequence_number",
            self.table("task_execution_logs")
        );
        let rows = sqlx::query(&select)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter()
            .map(|row| {
                let level_raw: String = row.try_get("level").map_err(StoreError::backend)?;
                Ok(TaskExecutionLog {
                    id: row.try_get("id").map_err(StoreError::backend)?,
                    task_id: row.try_get("task_id").map_err(StoreError::backend)?,
                    timestamp_utc: row.try_get("timestamp_utc").map_err(StoreError::backend)?,
                    level: log_level_from_str(&level_raw),
                    message: row.try_get("message").map_err(StoreError::backend)?,
                    exception_details: row
                        .try_get("exception_details")
                        .map_err(StoreError::backend)?,
                    sequence_number: row
                        .try_get("sequence_number")
                        .map_err(StoreError::backend)?,
                })
            })
            .collect()
    }

    async fn get_status_audits(&self, id: Uuid) -> Result<Vec<StatusAudit>, StoreError> {
        let select = format!(
            "SELECT * FROM {} WHERE queued_task_id = $1 ORDER BY id",
            self.table("status_audit")
        );
        let rows = sqlx::query(&select)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter()
            .map(|row| {
                let status_raw: String = row.try_get("new_status").map_err(StoreError::backend)?;
                Ok(StatusAudit {
                    id: row.try_get("id").map_err(StoreError::backend)?,
                    queued_task_id: row
                        .try_get("queued_task_id")
                        .map_err(StoreError::backend)?,
                    updated_at_utc: row
                        .try_get("updated_at_utc")
                        .map_err(StoreError::backend)?,
                    new_status: TaskStatus::parse(&status_raw).ok_or_else(|| {
                        StoreError::backend(anyhow::anyhow!("unknown status: {status_raw:?}"))
                    })?,
                    exception: row.try_get("exception").map_err(StoreError::backend)?,
                })
            })
            .collect()
    }

    async fn get_runs_audits(&self, id: Uuid) -> Result<Vec<RunsAudit>, StoreError> {
        let select = format!(
            "SELECT * FROM {} WHERE queued_task_id = $1 ORDER BY id",
            self.table("runs_audit")
        );
        let rows = sqlx::query(&select)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter()
            .map(|row| {
                let status_raw: String = row.try_get("status").map_err(StoreError::backend)?;
                Ok(RunsAudit {
                    id: row.try_get("id").map_err(StoreError::backend)?,
                    queued_task_id: row
                        .try_get("queued_task_id")
                        .map_err(StoreError::backend)?,
                    executed_at: row.try_get("executed_at").map_err(StoreError::backend)?,
                    status: TaskStatus::parse(&status_raw).ok_or_else(|| {
                        StoreError::backend(anyhow::anyhow!("unknown status: {status_raw:?}"))
                    })?,
                    exception: row.try_get("exception").map_err(StoreError::backend)?,
                    run_until: row.try_get("run_until").map_err(StoreError::backend)?,
                    execution_time_ms: row
                        .try_get("execution_time_ms")
                        .map_err(StoreError::backend)?,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for PgTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTaskStore")
            .field("schema", &self.schema)
            .field("max_logs_per_task", &self.max_logs_per_task)
            .finish_non_exhaustive()
    }
}
