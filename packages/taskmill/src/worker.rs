//! Worker executor: the run-time state machine for a single task execution.
//!
//! ```text
//! pickup ──► blacklisted? ─► mark Cancelled, stop
//!        ──► reload stored row (idempotent re-registration wins)
//!        ──► InProgress ─► register cancellation ─► resolve handler
//!        ──► OnStarted ─► Handle (timeout + retry policy)
//!        ──► OnCompleted / OnError ─► Completed | Failed | Cancelled | ServiceStopped
//!        ──► recurring? compute next from the *scheduled* time, never now
//!        ──► release handler, clear cancellation, flush captured logs
//! ```
//!
//! Cooperative cancellation: the handler receives a child of the shutdown
//! token. A user cancel triggers the same token; the outcome is told apart
//! by whether the shutdown root fired.

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancellation::{Blacklist, CancellationRegistry};
use crate::clock::Clock;
use crate::error::{AggregateError, ExecutionError};
use crate::executor::{PayloadDecodeError, TaskExecutor};
use crate::logging::{LogOptions, TaskLogger};
use crate::model::TaskStatus;
use crate::recurring::DEFAULT_MAX_ITERATIONS;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::task::TaskContext;

/// Shared dependencies a worker needs to run one task end-to-end.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) cancellations: Arc<CancellationRegistry>,
    pub(crate) blacklist: Arc<Blacklist>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) log_options: LogOptions,
}

enum RunOutcome {
    Completed,
    Failed(ExecutionError),
    Cancelled,
    Stopped,
}

/// Run one task to its final status.
pub(crate) async fn run_task(ctx: &WorkerContext, executor: TaskExecutor) {
    let task_id = executor.task_id;

    // Cancelled before start: discard, never create a cancellation source.
    if ctx.blacklist.take(task_id) {
        debug!(task_id = %task_id, "discarding blacklisted task");
        if executor.persisted {
            set_status(ctx, &executor, TaskStatus::Cancelled, None, None).await;
        }
        return;
    }

    // The stored row is authoritative: an idempotent re-registration may
    // have replaced the payload, audit level, or recurring rule since this
    // executor was built. Unpersisted tasks run from the embedded copy.
    let mut executor = executor;
    if executor.persisted {
        match ctx.store.get(task_id).await {
            Ok(Some(row)) => {
                if row.status == TaskStatus::Cancelled {
                    debug!(task_id = %task_id, "task cancelled while queued");
                    return;
                }
                // Re-registration moved the task back onto the scheduler
                // while this copy sat in the channel; the scheduler owns it.
                if row.status == TaskStatus::WaitingQueue {
                    if let Some(fire) = row.next_fire_time() {
                        if fire > ctx.clock.now_utc() {
                            debug!(task_id = %task_id, "superseded by a re-registration; skipping");
                            return;
                        }
                    }
                }
                executor.request = row.request;
                executor.audit_level = row.audit_level;
                executor.current_run = row.current_run_count.unwrap_or(0);
                if row.is_recurring {
                    if let Some(raw) = &row.recurring_task {
                        match serde_json::from_str(raw) {
                            Ok(spec) => executor.recurring = Some(spec),
                            Err(e) => {
                                warn!(task_id = %task_id, error = %e, "stored recurring rule unreadable");
                            }
                        }
                    }
                }
            }
            Ok(None) => executor.persisted = false,
            Err(e) => warn!(task_id = %task_id, error = %e, "could not reload task row"),
        }
    }

    set_status(ctx, &executor, TaskStatus::InProgress, None, None).await;

    let token = ctx.shutdown.child_token();
    ctx.cancellations.insert(task_id, token.clone());

    let logger = TaskLogger::new(task_id, ctx.log_options.clone());
    let handler = executor.resolve_handler();
    let policy = handler.retry_policy();
    let timeout = handler.timeout();

    guarded(task_id, "on_started", handler.on_started(task_id)).await;

    let started = Instant::now();
    let mut aggregate = AggregateError::new();
    let mut attempt: u32 = 1;

    let outcome = loop {
        let attempt_ctx = TaskContext::new(task_id, attempt, token.clone(), logger.clone());
        let run = handler.run(&executor.request, &attempt_ctx);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => break RunOutcome::Failed(ExecutionError::Timeout { limit }),
            },
            None => run.await,
        };

        match result {
            Ok(()) => break RunOutcome::Completed,
            Err(_) if token.is_cancelled() => break cancelled_outcome(ctx),
            Err(err) => {
                let message = format!("{err:#}");
                aggregate.push(&err);
                // A payload that cannot decode will not decode next time either.
                let delay = if err.downcast_ref::<PayloadDecodeError>().is_some() {
                    None
                } else {
                    policy.next_delay(attempt, &err)
                };
                match delay {
                    Some(delay) => {
                        guarded(task_id, "on_retry", handler.on_retry(task_id, attempt, &message))
                            .await;
                        debug!(task_id = %task_id, attempt, ?delay, "retrying after failure");
                        tokio::select! {
                            _ = token.cancelled() => break cancelled_outcome(ctx),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                    }
                    None => {
                        break RunOutcome::Failed(ExecutionError::Handler(std::mem::take(
                            &mut aggregate,
                        )))
                    }
                }
            }
        }
    };

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    match &outcome {
        RunOutcome::Completed => {
            guarded(task_id, "on_completed", handler.on_completed(task_id)).await;
        }
        RunOutcome::Failed(err) => {
            let rendered = err.to_string();
            guarded(
                task_id,
                "on_error",
                handler.on_error(task_id, &rendered, "task failed after exhausting retries"),
            )
            .await;
        }
        RunOutcome::Cancelled | RunOutcome::Stopped => {}
    }

    let (status, exception) = match &outcome {
        RunOutcome::Completed => (TaskStatus::Completed, None),
        RunOutcome::Failed(err) => (TaskStatus::Failed, Some(err.to_string())),
        RunOutcome::Cancelled => {
            (TaskStatus::Cancelled, Some(ExecutionError::Cancelled.to_string()))
        }
        RunOutcome::Stopped => {
            (TaskStatus::ServiceStopped, Some(ExecutionError::Stopped.to_string()))
        }
    };

    match status {
        TaskStatus::Completed => info!(task_id = %task_id, elapsed_ms, "task completed"),
        TaskStatus::Failed => {
            error!(task_id = %task_id, exception = exception.as_deref(), "task failed")
        }
        _ => info!(task_id = %task_id, %status, "task interrupted"),
    }

    set_status(ctx, &executor, status, exception.as_deref(), Some(elapsed_ms)).await;

    if executor.is_recurring() && executor.persisted {
        finish_recurring(ctx, &executor, status, elapsed_ms).await;
    }

    ctx.cancellations.remove(task_id);
    drop(handler);

    let captured = logger.drain();
    if !captured.is_empty() && executor.persisted {
        if let Err(e) = ctx.store.append_execution_logs(task_id, captured).await {
            warn!(task_id = %task_id, error = %e, "could not persist execution logs");
        }
    }
}

/// Close out one recurring occurrence and put the next one on the wheel.
///
/// The rhythm anchor is the occurrence's *scheduled* time; wall-clock now is
/// only the reference for deciding what already passed.
async fn finish_recurring(
    ctx: &WorkerContext,
    executor: &TaskExecutor,
    status: TaskStatus,
    elapsed_ms: f64,
) {
    let task_id = executor.task_id;
    let Some(spec) = executor.recurring.clone() else {
        return;
    };

    // Shutdown leaves the row pending; recovery resumes the schedule with
    // the run counter untouched.
    if status == TaskStatus::ServiceStopped {
        return;
    }

    let now = ctx.clock.now_utc();
    let anchor = executor.scheduled_for.unwrap_or(now);
    let completed_runs = executor.current_run + 1;

    let plan = if status == TaskStatus::Cancelled {
        // The caller stopped the series; record the interrupted run only.
        crate::recurring::NextRunPlan::exhausted()
    } else {
        spec.next_valid_run(anchor, completed_runs, now, DEFAULT_MAX_ITERATIONS)
    };

    if let Err(e) = ctx
        .store
        .update_current_run(task_id, elapsed_ms, plan.next_run, executor.audit_level)
        .await
    {
        warn!(task_id = %task_id, error = %e, "could not record recurring run");
    }
    if !plan.skipped.is_empty() {
        if let Err(e) = ctx.store.record_skipped_occurrences(task_id, &plan.skipped).await {
            warn!(task_id = %task_id, error = %e, "could not record skipped occurrences");
        }
    }

    if let Some(next) = plan.next_run {
        set_status(ctx, executor, TaskStatus::WaitingQueue, None, None).await;
        debug!(task_id = %task_id, next_run = %next, run = completed_runs, "recurring task re-scheduled");
        ctx.scheduler.schedule(executor.advanced(next, completed_runs), next);
    } else {
        debug!(task_id = %task_id, runs = completed_runs, "recurring task exhausted");
    }
}

fn cancelled_outcome(ctx: &WorkerContext) -> RunOutcome {
    if ctx.shutdown.is_cancelled() {
        RunOutcome::Stopped
    } else {
        RunOutcome::Cancelled
    }
}

async fn set_status(
    ctx: &WorkerContext,
    executor: &TaskExecutor,
    status: TaskStatus,
    exception: Option<&str>,
    execution_time_ms: Option<f64>,
) {
    if !executor.persisted {
        return;
    }
    if let Err(e) = ctx
        .store
        .set_status(executor.task_id, status, exception, executor.audit_level, execution_time_ms)
        .await
    {
        warn!(task_id = %executor.task_id, ?status, error = %e, "status update failed");
    }
}

/// Lifecycle callbacks never fail the task: panics are caught and logged.
async fn guarded<F>(task_id: Uuid, name: &str, callback: F)
where
    F: std::future::Future<Output = ()>,
{
    if AssertUnwindSafe(callback).catch_unwind().await.is_err() {
        warn!(task_id = %task_id, callback = name, "lifecycle callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::executor::HandlerResolution;
    use crate::memory::InMemoryTaskStore;
    use crate::model::{AuditLevel, QueuedTask};
    use crate::registry::HandlerRegistry;
    use crate::retry::RetryPolicy;
    use crate::task::TaskHandler;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Probe {
        fail_first: u32,
        sleep_ms: u64,
    }

    #[derive(Default)]
    struct ProbeState {
        attempts: AtomicU32,
        started: AtomicU32,
        completed: AtomicU32,
        errored: AtomicU32,
        retried: AtomicU32,
    }

    struct ProbeHandler {
        state: Arc<ProbeState>,
        timeout: Option<Duration>,
        retry: RetryPolicy,
    }

    #[async_trait]
    impl TaskHandler for ProbeHandler {
        type Task = Probe;

        async fn handle(&self, task: Probe, ctx: &TaskContext) -> anyhow::Result<()> {
            let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if task.sleep_ms > 0 {
                tokio::select! {
                    _ = ctx.cancellation().cancelled() => {
                        anyhow::bail!("observed cancellation");
                    }
                    _ = tokio::time::sleep(Duration::from_millis(task.sleep_ms)) => {}
                }
            }
            if attempt <= task.fail_first {
                anyhow::bail!("attempt {attempt} failed");
            }
            ctx.logger().info(format!("attempt {attempt} ok"));
            Ok(())
        }

        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }

        fn retry_policy(&self) -> RetryPolicy {
            self.retry.clone()
        }

        async fn on_started(&self, _task_id: Uuid) {
            self.state.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_completed(&self, _task_id: Uuid) {
            self.state.completed.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_error(&self, _task_id: Uuid, _error: &str, _message: &str) {
            self.state.errored.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_retry(&self, _task_id: Uuid, _attempt: u32, _error: &str) {
            self.state.retried.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        ctx: WorkerContext,
        store: Arc<InMemoryTaskStore>,
        state: Arc<ProbeState>,
        executor: TaskExecutor,
    }

    async fn fixture(task: Probe, timeout: Option<Duration>, retry: RetryPolicy) -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let state = Arc::new(ProbeState::default());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut registry = HandlerRegistry::new();
        {
            let state = state.clone();
            registry.register::<ProbeHandler, _>(move || ProbeHandler {
                state: state.clone(),
                timeout,
                retry: retry.clone(),
            });
        }
        let entry = registry.resolve(std::any::type_name::<Probe>()).unwrap();

        let id = Uuid::new_v4();
        let request = serde_json::to_string(&task).unwrap();
        store
            .persist(QueuedTask {
                id,
                task_key: None,
                task_type: std::any::type_name::<Probe>().into(),
                handler: entry.handler_type().into(),
                request: request.clone(),
                status: TaskStatus::Queued,
                queue_name: None,
                audit_level: AuditLevel::Full,
                is_recurring: false,
                recurring_task: None,
                recurring_info: None,
                created_at_utc: Utc::now(),
                scheduled_execution_utc: None,
                next_run_utc: None,
                last_execution_utc: None,
                current_run_count: None,
                max_runs: None,
                run_until: None,
                exception: None,
                execution_time_ms: None,
            })
            .await
            .unwrap();

        let executor = TaskExecutor {
            task_id: id,
            task_type: std::any::type_name::<Probe>().into(),
            request,
            queue_name: None,
            audit_level: AuditLevel::Full,
            recurring: None,
            scheduled_for: None,
            current_run: 0,
            persisted: true,
            handler: HandlerResolution::Lazy(entry),
        };

        let ctx = WorkerContext {
            store: store.clone(),
            scheduler: Arc::new(Scheduler::new(1, Duration::from_millis(20), clock.clone())),
            cancellations: Arc::new(CancellationRegistry::new()),
            blacklist: Arc::new(Blacklist::new()),
            clock,
            shutdown: CancellationToken::new(),
            log_options: LogOptions::default(),
        };

        Fixture { ctx, store, state, executor }
    }

    #[tokio::test]
    async fn test_successful_run_reaches_completed() {
        let f = fixture(Probe { fail_first: 0, sleep_ms: 0 }, None, RetryPolicy::never()).await;
        let id = f.executor.task_id;
        run_task(&f.ctx, f.executor).await;

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.last_execution_utc.is_some());
        assert!(task.execution_time_ms.is_some());
        assert_eq!(task.exception, None);

        let audits = f.store.get_status_audits(id).await.unwrap();
        let trail: Vec<TaskStatus> = audits.iter().map(|a| a.new_status).collect();
        assert_eq!(
            trail,
            vec![TaskStatus::Queued, TaskStatus::InProgress, TaskStatus::Completed]
        );

        assert_eq!(f.state.started.load(Ordering::SeqCst), 1);
        assert_eq!(f.state.completed.load(Ordering::SeqCst), 1);
        assert_eq!(f.state.errored.load(Ordering::SeqCst), 0);

        // The cancellation handle is released.
        assert!(f.ctx.cancellations.is_empty());

        // Captured logs were flushed.
        let logs = f.store.get_execution_logs(id).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let f = fixture(
            Probe { fail_first: 2, sleep_ms: 0 },
            None,
            RetryPolicy::linear(3, Duration::from_millis(5)),
        )
        .await;
        let id = f.executor.task_id;
        run_task(&f.ctx, f.executor).await;

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(f.state.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(f.state.retried.load(Ordering::SeqCst), 2);
        assert_eq!(f.state.completed.load(Ordering::SeqCst), 1);

        // Intermediate retry failures are not separate audits.
        let audits = f.store.get_status_audits(id).await.unwrap();
        assert_eq!(audits.len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_aggregate() {
        let f = fixture(
            Probe { fail_first: 10, sleep_ms: 0 },
            None,
            RetryPolicy::linear(2, Duration::from_millis(5)),
        )
        .await;
        let id = f.executor.task_id;
        run_task(&f.ctx, f.executor).await;

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let exception = task.exception.unwrap();
        assert!(exception.contains("3 attempt(s) failed"));
        assert!(exception.contains("[1] attempt 1 failed"));
        assert!(exception.contains("[3] attempt 3 failed"));

        assert_eq!(f.state.errored.load(Ordering::SeqCst), 1);
        assert_eq!(f.state.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_becomes_failed_with_marker() {
        let f = fixture(
            Probe { fail_first: 0, sleep_ms: 5_000 },
            Some(Duration::from_millis(50)),
            RetryPolicy::never(),
        )
        .await;
        let id = f.executor.task_id;
        run_task(&f.ctx, f.executor).await;

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.exception.unwrap().contains("TimeoutException"));
    }

    #[tokio::test]
    async fn test_cancel_during_run_is_cancelled() {
        let f = fixture(Probe { fail_first: 0, sleep_ms: 5_000 }, None, RetryPolicy::never()).await;
        let id = f.executor.task_id;
        let cancellations = f.ctx.cancellations.clone();

        let handle = {
            let ctx = f.ctx.clone();
            let executor = f.executor;
            tokio::spawn(async move { run_task(&ctx, executor).await })
        };
        // Wait for the run to register its handle, then cancel.
        while !cancellations.contains(id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cancellations.cancel(id));
        handle.await.unwrap();

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.exception.unwrap().contains("OperationCanceledException"));
    }

    #[tokio::test]
    async fn test_shutdown_during_run_is_service_stopped() {
        let f = fixture(Probe { fail_first: 0, sleep_ms: 5_000 }, None, RetryPolicy::never()).await;
        let id = f.executor.task_id;
        let cancellations = f.ctx.cancellations.clone();
        let shutdown = f.ctx.shutdown.clone();

        let handle = {
            let ctx = f.ctx.clone();
            let executor = f.executor;
            tokio::spawn(async move { run_task(&ctx, executor).await })
        };
        while !cancellations.contains(id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::ServiceStopped);
        assert!(task.last_execution_utc.is_some());
    }

    #[tokio::test]
    async fn test_blacklisted_task_never_starts() {
        let f = fixture(Probe { fail_first: 0, sleep_ms: 0 }, None, RetryPolicy::never()).await;
        let id = f.executor.task_id;
        f.ctx.blacklist.insert(id);
        run_task(&f.ctx, f.executor).await;

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(f.state.started.load(Ordering::SeqCst), 0);
        assert_eq!(f.state.attempts.load(Ordering::SeqCst), 0);

        let audits = f.store.get_status_audits(id).await.unwrap();
        assert!(audits.iter().all(|a| a.new_status != TaskStatus::InProgress));
    }

    #[tokio::test]
    async fn test_decode_failure_is_not_retried() {
        let mut f = fixture(
            Probe { fail_first: 0, sleep_ms: 0 },
            None,
            RetryPolicy::linear(5, Duration::from_millis(5)),
        )
        .await;
        f.executor.request = r#"{"nonsense":true}"#.into();
        // The stored row drives the payload; corrupt it there too.
        let mut row = f.store.get(f.executor.task_id).await.unwrap().unwrap();
        row.request = r#"{"nonsense":true}"#.into();
        f.store.update_task(row).await.unwrap();

        let id = f.executor.task_id;
        run_task(&f.ctx, f.executor).await;

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.exception.unwrap().contains("deserialization failed"));
        assert_eq!(f.state.retried.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recurring_completion_reschedules_from_anchor() {
        let mut f = fixture(Probe { fail_first: 0, sleep_ms: 0 }, None, RetryPolicy::never()).await;
        let id = f.executor.task_id;

        let spec = crate::recurring::RecurringSpec::every_seconds(30);
        let anchor = Utc::now();
        let mut row = f.store.get(id).await.unwrap().unwrap();
        row.is_recurring = true;
        row.recurring_task = Some(serde_json::to_string(&spec).unwrap());
        f.store.update_task(row).await.unwrap();

        f.executor.recurring = Some(spec);
        f.executor.scheduled_for = Some(anchor);
        run_task(&f.ctx, f.executor).await;

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::WaitingQueue);
        assert_eq!(task.current_run_count, Some(1));
        // Next run is anchored to the scheduled time, not completion time.
        assert_eq!(task.next_run_utc, Some(anchor + chrono::Duration::seconds(30)));

        let runs = f.store.get_runs_audits(id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, TaskStatus::Completed);

        // The next occurrence is on the wheel.
        assert_eq!(f.ctx.scheduler.len(), 1);
    }

    #[tokio::test]
    async fn test_recurring_exhaustion_stays_terminal() {
        let mut f = fixture(Probe { fail_first: 0, sleep_ms: 0 }, None, RetryPolicy::never()).await;
        let id = f.executor.task_id;

        let spec = crate::recurring::RecurringSpec::every_seconds(30).with_max_runs(1);
        let mut row = f.store.get(id).await.unwrap().unwrap();
        row.is_recurring = true;
        row.recurring_task = Some(serde_json::to_string(&spec).unwrap());
        f.store.update_task(row).await.unwrap();

        f.executor.recurring = Some(spec);
        f.executor.scheduled_for = Some(Utc::now());
        run_task(&f.ctx, f.executor).await;

        let task = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.current_run_count, Some(1));
        assert_eq!(task.next_run_utc, None);
        assert!(f.ctx.scheduler.is_empty());

        // Exactly queued, inprogress, completed - no second Completed audit.
        let audits = f.store.get_status_audits(id).await.unwrap();
        assert_eq!(audits.len(), 3);
    }
}
