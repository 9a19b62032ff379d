//! Engine assembly and host lifecycle.
//!
//! ```text
//! EngineBuilder ─► Engine ─► start() ─► EngineHandle
//!                              │
//!                              ├─ recovery: re-drive pending rows
//!                              ├─ scheduler fibres (1 or k shards)
//!                              └─ queue pumps (one per queue, semaphore-bounded)
//! ```
//!
//! # Startup recovery
//!
//! Pending rows are re-routed: `InProgress` at startup means the previous
//! host died mid-run, so the task goes back to `Queued`; `WaitingQueue` rows
//! re-enter the scheduler, catching up through the recurring rule when their
//! fire time already passed (missed occurrences are recorded, never
//! executed in a burst).
//!
//! # Graceful shutdown
//!
//! One root token fans out to every pump, scheduler fibre, and in-flight
//! handler. Handlers that finish inside the grace period complete normally;
//! the rest have their rows marked `ServiceStopped` and are picked up by the
//! next start. A handler that ignores its token keeps its tokio task alive
//! past the grace period; its row is still marked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancellation::{Blacklist, CancellationRegistry};
use crate::clock::{Clock, SystemClock};
use crate::dispatch::{Dispatcher, DispatcherInner};
use crate::error::{ExecutionError, StoreError};
use crate::executor::{HandlerResolution, TaskExecutor};
use crate::logging::LogOptions;
use crate::model::{AuditLevel, QueuedTask, TaskStatus};
use crate::queue::{QueueManager, QueueOptions, WorkerQueue};
use crate::recurring::{RecurringSpec, DEFAULT_MAX_ITERATIONS};
use crate::registry::HandlerRegistry;
use crate::scheduler::{FireTarget, Scheduler, DEFAULT_TICK};
use crate::store::TaskStore;
use crate::task::TaskHandler;
use crate::worker::{run_task, WorkerContext};

/// Configuration surface for assembling an [`Engine`].
pub struct EngineBuilder {
    store: Arc<dyn TaskStore>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    default_queue: QueueOptions,
    recurring_queue: QueueOptions,
    named_queues: HashMap<String, QueueOptions>,
    scheduler_shards: usize,
    scheduler_tick: StdDuration,
    lazy_enabled: bool,
    lazy_delay_threshold: StdDuration,
    default_audit_level: AuditLevel,
    log_options: LogOptions,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            registry: HandlerRegistry::new(),
            clock: Arc::new(SystemClock),
            default_queue: QueueOptions::default(),
            recurring_queue: QueueOptions::default(),
            named_queues: HashMap::new(),
            scheduler_shards: 1,
            scheduler_tick: DEFAULT_TICK,
            lazy_enabled: false,
            lazy_delay_threshold: StdDuration::from_secs(30 * 60),
            default_audit_level: AuditLevel::Full,
            log_options: LogOptions::default(),
        }
    }

    /// Register a handler for its task type.
    pub fn register<H, F>(mut self, factory: F) -> Self
    where
        H: TaskHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry.register::<H, F>(factory);
        self
    }

    /// Bound of the default queue's channel.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.default_queue = self.default_queue.with_capacity(capacity);
        self
    }

    /// Worker-pool size of the default queue.
    pub fn max_parallelism(mut self, n: usize) -> Self {
        self.default_queue = self.default_queue.with_parallelism(n);
        self
    }

    /// Declare an additional named queue.
    pub fn add_queue(mut self, name: impl Into<String>, options: QueueOptions) -> Self {
        self.named_queues.insert(name.into(), options);
        self
    }

    pub fn configure_default_queue(mut self, options: QueueOptions) -> Self {
        self.default_queue = options;
        self
    }

    pub fn configure_recurring_queue(mut self, options: QueueOptions) -> Self {
        self.recurring_queue = options;
        self
    }

    /// Opt into the sharded scheduler with `shards` independent heaps.
    pub fn sharded_scheduler(mut self, shards: usize) -> Self {
        self.scheduler_shards = shards.max(1);
        self
    }

    /// Tick period of the scheduler fibres. Mostly useful in tests.
    pub fn scheduler_tick(mut self, tick: StdDuration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    /// Enable the adaptive lazy handler resolution rule.
    pub fn lazy_handler_resolution(mut self, enabled: bool) -> Self {
        self.lazy_enabled = enabled;
        self
    }

    /// How far out a delayed task must be to resolve its handler lazily.
    pub fn lazy_resolution_threshold(mut self, threshold: StdDuration) -> Self {
        self.lazy_delay_threshold = threshold;
        self
    }

    pub fn default_audit_level(mut self, level: AuditLevel) -> Self {
        self.default_audit_level = level;
        self
    }

    /// Configure captured execution-log persistence.
    pub fn persistent_logs(mut self, options: LogOptions) -> Self {
        self.log_options = options;
        self
    }

    pub fn disable_persistent_logs(mut self) -> Self {
        self.log_options = LogOptions::disabled();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Engine {
        let queues = Arc::new(QueueManager::new(
            self.default_queue,
            self.recurring_queue,
            self.named_queues,
        ));
        let scheduler = Arc::new(Scheduler::new(
            self.scheduler_shards,
            self.scheduler_tick,
            self.clock.clone(),
        ));
        Engine {
            store: self.store,
            registry: Arc::new(self.registry),
            clock: self.clock,
            queues,
            scheduler,
            lazy_enabled: self.lazy_enabled,
            lazy_delay_threshold: self.lazy_delay_threshold,
            default_audit_level: self.default_audit_level,
            log_options: self.log_options,
        }
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("handlers", &self.registry.len())
            .field("scheduler_shards", &self.scheduler_shards)
            .finish_non_exhaustive()
    }
}

/// Assembled but not yet running.
pub struct Engine {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    queues: Arc<QueueManager>,
    scheduler: Arc<Scheduler>,
    lazy_enabled: bool,
    lazy_delay_threshold: StdDuration,
    default_audit_level: AuditLevel,
    log_options: LogOptions,
}

impl Engine {
    pub fn builder(store: Arc<dyn TaskStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    /// Run recovery, spawn the scheduler fibres and queue pumps, and return
    /// the running handle.
    pub async fn start(self) -> EngineHandle {
        let shutdown = CancellationToken::new();
        let cancellations = Arc::new(CancellationRegistry::new());
        let blacklist = Arc::new(Blacklist::new());
        let tracker = TaskTracker::new();

        let core = Arc::new(EngineCore {
            store: self.store.clone(),
            queues: self.queues.clone(),
        });

        let worker_ctx = WorkerContext {
            store: self.store.clone(),
            scheduler: self.scheduler.clone(),
            cancellations: cancellations.clone(),
            blacklist: blacklist.clone(),
            clock: self.clock.clone(),
            shutdown: shutdown.clone(),
            log_options: self.log_options.clone(),
        };

        let mut pumps = self.scheduler.start(core.clone(), shutdown.clone());
        for queue in self.queues.all() {
            pumps.push(spawn_pump(
                Arc::clone(queue),
                worker_ctx.clone(),
                tracker.clone(),
                shutdown.clone(),
            ));
        }

        info!(
            queues = ?self.queues.names(),
            shards = self.scheduler.shard_count(),
            handlers = self.registry.len(),
            "task engine started"
        );

        recover(&self, &core).await;

        let dispatcher = Dispatcher::new(Arc::new(DispatcherInner {
            store: self.store.clone(),
            registry: self.registry.clone(),
            queues: self.queues.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
            default_audit_level: self.default_audit_level,
            lazy_enabled: self.lazy_enabled,
            lazy_delay_threshold: Duration::from_std(self.lazy_delay_threshold)
                .unwrap_or_else(|_| Duration::minutes(30)),
            lazy_recurring_threshold: Duration::minutes(5),
            shutdown: shutdown.clone(),
        }));

        EngineHandle {
            dispatcher,
            store: self.store,
            scheduler: self.scheduler,
            cancellations,
            blacklist,
            default_audit_level: self.default_audit_level,
            shutdown,
            tracker,
            pumps,
        }
    }
}

/// Running engine. Dropping the handle does not stop the engine; call
/// [`EngineHandle::shutdown`] for an orderly stop.
pub struct EngineHandle {
    dispatcher: Dispatcher,
    store: Arc<dyn TaskStore>,
    scheduler: Arc<Scheduler>,
    cancellations: Arc<CancellationRegistry>,
    blacklist: Arc<Blacklist>,
    default_audit_level: AuditLevel,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    pumps: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Tasks currently waiting in the scheduler.
    pub fn scheduled_count(&self) -> usize {
        self.scheduler.len()
    }

    /// Cancel a task. In-progress tasks get their token triggered and
    /// finish as `Cancelled`; not-started tasks are blacklisted and marked
    /// `Cancelled` without ever creating a cancellation source.
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), StoreError> {
        if self.cancellations.cancel(task_id) {
            info!(task_id = %task_id, "cancellation requested for running task");
            return Ok(());
        }
        self.blacklist.insert(task_id);
        let level = match self.store.get(task_id).await? {
            Some(task) => task.audit_level,
            None => self.default_audit_level,
        };
        self.store
            .set_status(task_id, TaskStatus::Cancelled, None, level, None)
            .await?;
        info!(task_id = %task_id, "task cancelled before start");
        Ok(())
    }

    /// Cooperative shutdown: signal everything, wait up to `grace` for
    /// in-flight work, then mark whatever is still running `ServiceStopped`.
    pub async fn shutdown(self, grace: StdDuration) {
        info!("task engine stopping");
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            let stragglers = self.cancellations.active_ids();
            warn!(count = stragglers.len(), "grace period expired with tasks still running");
            let exception = ExecutionError::Stopped.to_string();
            for task_id in stragglers {
                let level = match self.store.get(task_id).await {
                    Ok(Some(task)) => task.audit_level,
                    _ => self.default_audit_level,
                };
                if let Err(e) = self
                    .store
                    .set_status(task_id, TaskStatus::ServiceStopped, Some(&exception), level, None)
                    .await
                {
                    warn!(task_id = %task_id, error = %e, "could not mark task service-stopped");
                }
            }
        }

        for pump in self.pumps {
            pump.abort();
        }
        info!("task engine stopped");
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("scheduled", &self.scheduler.len())
            .field("running", &self.cancellations.len())
            .finish_non_exhaustive()
    }
}

/// Fire path shared by the scheduler fibres and recovery.
struct EngineCore {
    store: Arc<dyn TaskStore>,
    queues: Arc<QueueManager>,
}

impl EngineCore {
    async fn mark_queued_and_enqueue(&self, executor: TaskExecutor) {
        if executor.persisted {
            if let Err(e) = self
                .store
                .set_status(executor.task_id, TaskStatus::Queued, None, executor.audit_level, None)
                .await
            {
                warn!(task_id = %executor.task_id, error = %e, "could not mark task queued");
            }
        }
        let queue = self
            .queues
            .resolve(executor.queue_name.as_deref(), executor.is_recurring());
        let task_id = executor.task_id;
        if queue.enqueue(executor).await.is_err() {
            warn!(task_id = %task_id, "queue closed; task stays pending for the next start");
        }
    }
}

#[async_trait]
impl FireTarget for EngineCore {
    async fn fire(&self, executor: TaskExecutor) {
        // Re-validate against the store: a re-registration may have moved or
        // finished this task since the entry was pushed onto the heap.
        if executor.persisted {
            match self.store.get(executor.task_id).await {
                Ok(Some(row)) => {
                    if row.status != TaskStatus::WaitingQueue {
                        debug!(task_id = %executor.task_id, status = %row.status, "stale scheduler entry dropped");
                        return;
                    }
                    if let (Some(expected), Some(actual)) =
                        (executor.scheduled_for, row.next_fire_time())
                    {
                        if (actual - expected).num_milliseconds().abs() > 1_000 {
                            debug!(task_id = %executor.task_id, "superseded scheduler entry dropped");
                            return;
                        }
                    }
                }
                Ok(None) => {
                    debug!(task_id = %executor.task_id, "scheduled task no longer exists");
                    return;
                }
                Err(e) => {
                    warn!(task_id = %executor.task_id, error = %e, "fire-time validation failed; running anyway");
                }
            }
        }
        self.mark_queued_and_enqueue(executor).await;
    }
}

/// One pump per queue: pull, bound by the queue's parallelism, run.
///
/// With `max_parallelism = 1` the permit is not released until the previous
/// task finished, so tasks of that queue never overlap and run in enqueue
/// order.
fn spawn_pump(
    queue: Arc<WorkerQueue>,
    ctx: WorkerContext,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut rx) = queue.take_receiver() else {
            error!(queue = queue.name(), "queue receiver already taken");
            return;
        };
        let semaphore = Arc::new(tokio::sync::Semaphore::new(queue.options().max_parallelism));
        loop {
            let executor = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(executor) => executor,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let ctx = ctx.clone();
            tracker.spawn(async move {
                run_task(&ctx, executor).await;
                drop(permit);
            });
        }
        debug!(queue = queue.name(), "queue pump stopped");
    })
}

/// Re-drive every pending row on startup.
async fn recover(engine: &Engine, core: &Arc<EngineCore>) {
    let pending = match engine.store.retrieve_pending(None, None).await {
        Ok(pending) => pending,
        Err(e) => {
            error!(error = %e, "could not read pending tasks; recovery skipped");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }
    info!(count = pending.len(), "recovering pending tasks");

    let now = engine.clock.now_utc();
    for task in pending {
        let Some(entry) = engine.registry.resolve(&task.task_type) else {
            warn!(task_id = %task.id, task_type = %task.task_type, "no handler registered; failing task");
            let reason = format!("no handler registered for task type {}", task.task_type);
            if let Err(e) = engine
                .store
                .set_status(task.id, TaskStatus::Failed, Some(&reason), task.audit_level, None)
                .await
            {
                warn!(task_id = %task.id, error = %e, "could not fail unrecoverable task");
            }
            continue;
        };

        let recurring: Option<RecurringSpec> = task
            .recurring_task
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        let executor = TaskExecutor {
            task_id: task.id,
            task_type: task.task_type.clone(),
            request: task.request.clone(),
            queue_name: task.queue_name.clone(),
            audit_level: task.audit_level,
            recurring: recurring.clone(),
            scheduled_for: task.next_fire_time(),
            current_run: task.current_run_count.unwrap_or(0),
            persisted: true,
            handler: HandlerResolution::Lazy(entry),
        };

        match task.status {
            // Interrupted mid-run (crash or shutdown): run it again.
            TaskStatus::InProgress | TaskStatus::ServiceStopped | TaskStatus::Pending => {
                debug!(task_id = %task.id, status = %task.status, "re-queueing interrupted task");
                core.mark_queued_and_enqueue(executor).await;
            }
            TaskStatus::Queued => {
                core.mark_queued_and_enqueue(executor).await;
            }
            TaskStatus::WaitingQueue => {
                recover_waiting(engine, core, task, recurring, executor, now).await;
            }
            other => {
                debug!(task_id = %task.id, status = %other, "nothing to recover");
            }
        }
    }
}

async fn recover_waiting(
    engine: &Engine,
    core: &Arc<EngineCore>,
    mut task: QueuedTask,
    recurring: Option<RecurringSpec>,
    mut executor: TaskExecutor,
    now: chrono::DateTime<chrono::Utc>,
) {
    let Some(fire_at) = task.next_fire_time() else {
        warn!(task_id = %task.id, "waiting task has no fire time; failing it");
        let _ = engine
            .store
            .set_status(
                task.id,
                TaskStatus::Failed,
                Some("scheduled task carries no fire time"),
                task.audit_level,
                None,
            )
            .await;
        return;
    };

    if fire_at > now {
        engine.scheduler.schedule(executor, fire_at);
        return;
    }

    match &recurring {
        Some(spec) => {
            // The persisted fire time passed while the host was down: skip
            // the missed occurrences and resume the original rhythm.
            let plan = spec.next_valid_run(
                fire_at,
                task.current_run_count.unwrap_or(0),
                now,
                DEFAULT_MAX_ITERATIONS,
            );
            if !plan.skipped.is_empty() {
                if let Err(e) = engine
                    .store
                    .record_skipped_occurrences(task.id, &plan.skipped)
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "could not record skipped occurrences");
                }
            }
            match plan.next_run {
                Some(next) => {
                    task.next_run_utc = Some(next);
                    if let Err(e) = engine.store.update_task(task.clone()).await {
                        warn!(task_id = %task.id, error = %e, "could not persist caught-up fire time");
                    }
                    executor.scheduled_for = Some(next);
                    debug!(task_id = %task.id, next_run = %next, skipped = plan.skipped.len(), "recurring task caught up");
                    engine.scheduler.schedule(executor, next);
                }
                None => {
                    debug!(task_id = %task.id, "recurring rule exhausted during downtime");
                    let _ = engine
                        .store
                        .set_status(task.id, TaskStatus::Completed, None, task.audit_level, None)
                        .await;
                }
            }
        }
        None => {
            // Overdue one-shot: run immediately.
            core.mark_queued_and_enqueue(executor).await;
        }
    }
}
