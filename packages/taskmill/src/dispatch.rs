//! The dispatcher: validates, persists, and routes tasks.
//!
//! The resolution sequence for every dispatch:
//!
//! 1. Look up the handler registration (failing synchronously when missing).
//! 2. Serialize the payload and build the durable draft.
//! 3. Pick the queue and the handler resolution strategy (eager vs lazy).
//! 4. When a `task_key` is supplied and a row already holds it, enter
//!    idempotent registration - no-op, update in place, or replace,
//!    depending on the existing row's state.
//! 5. Persist, then hand the executor to a queue (immediate) or the
//!    scheduler (delayed / recurring).
//!
//! Persistence failures only propagate when the dispatch demanded
//! durability; otherwise they are logged and the task still runs
//! best-effort.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{DispatchError, StoreError};
use crate::executor::{HandlerResolution, TaskExecutor};
use crate::model::{AuditLevel, QueuedTask, TaskStatus, MAX_TASK_KEY_LEN, MAX_TYPE_NAME_LEN};
use crate::queue::QueueManager;
use crate::recurring::{RecurringSpec, DEFAULT_MAX_ITERATIONS};
use crate::registry::{HandlerEntry, HandlerRegistry};
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::task::TaskPayload;

/// When a one-shot task should fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Schedule {
    /// Straight into the queue.
    #[default]
    Immediate,
    /// After a relative delay.
    Delayed(StdDuration),
    /// At a wall-clock instant; past instants fire on the next tick.
    At(DateTime<Utc>),
}

/// Per-dispatch options.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub schedule: Schedule,
    /// Makes the task recurring. A `Delayed`/`At` schedule folds into the
    /// rule's initial delay / anchor when the rule does not set its own.
    pub recurring: Option<RecurringSpec>,
    /// Queue requested by the caller; the handler's own preference wins.
    pub queue: Option<String>,
    /// Idempotency key; at most one live row per key.
    pub task_key: Option<String>,
    /// Audit policy override; the engine default applies otherwise.
    pub audit_level: Option<AuditLevel>,
    /// Fail the dispatch when the row cannot be persisted, instead of
    /// running best-effort.
    pub throw_if_unable_to_persist: bool,
}

impl DispatchOptions {
    pub fn delayed(delay: StdDuration) -> Self {
        Self { schedule: Schedule::Delayed(delay), ..Self::default() }
    }

    pub fn at(when: DateTime<Utc>) -> Self {
        Self { schedule: Schedule::At(when), ..Self::default() }
    }

    pub fn recurring(spec: RecurringSpec) -> Self {
        Self { recurring: Some(spec), ..Self::default() }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.task_key = Some(key.into());
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_audit_level(mut self, level: AuditLevel) -> Self {
        self.audit_level = Some(level);
        self
    }

    pub fn require_durability(mut self) -> Self {
        self.throw_if_unable_to_persist = true;
        self
    }
}

pub(crate) struct DispatcherInner {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) queues: Arc<QueueManager>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) default_audit_level: AuditLevel,
    pub(crate) lazy_enabled: bool,
    /// Delayed tasks at least this far out resolve their handler lazily.
    pub(crate) lazy_delay_threshold: Duration,
    /// Recurring tasks spaced at least this far apart resolve lazily.
    pub(crate) lazy_recurring_threshold: Duration,
    pub(crate) shutdown: CancellationToken,
}

/// Public entry point for submitting tasks. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub(crate) fn new(inner: Arc<DispatcherInner>) -> Self {
        Self { inner }
    }

    /// Dispatch for immediate execution.
    pub async fn dispatch<T: TaskPayload>(&self, task: T) -> Result<Uuid, DispatchError> {
        self.dispatch_with(task, DispatchOptions::default()).await
    }

    /// Dispatch after a relative delay.
    pub async fn dispatch_in<T: TaskPayload>(
        &self,
        task: T,
        delay: StdDuration,
    ) -> Result<Uuid, DispatchError> {
        self.dispatch_with(task, DispatchOptions::delayed(delay)).await
    }

    /// Dispatch at a specific wall-clock time.
    pub async fn dispatch_at<T: TaskPayload>(
        &self,
        task: T,
        when: DateTime<Utc>,
    ) -> Result<Uuid, DispatchError> {
        self.dispatch_with(task, DispatchOptions::at(when)).await
    }

    /// Dispatch on a recurring rule.
    pub async fn dispatch_recurring<T: TaskPayload>(
        &self,
        task: T,
        spec: RecurringSpec,
    ) -> Result<Uuid, DispatchError> {
        self.dispatch_with(task, DispatchOptions::recurring(spec)).await
    }

    /// Dispatch with full control over schedule, key, queue, and audit level.
    pub async fn dispatch_with<T: TaskPayload>(
        &self,
        task: T,
        options: DispatchOptions,
    ) -> Result<Uuid, DispatchError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        let type_name = std::any::type_name::<T>();
        let entry = self.inner.registry.resolve(type_name).ok_or_else(|| {
            DispatchError::HandlerNotRegistered { type_name: type_name.to_string() }
        })?;
        let request = serde_json::to_string(&task).map_err(|source| {
            DispatchError::Serialization { type_name: type_name.to_string(), source }
        })?;

        self.dispatch_draft(entry, type_name, request, options).await
    }

    async fn dispatch_draft(
        &self,
        entry: Arc<HandlerEntry>,
        type_name: &str,
        request: String,
        options: DispatchOptions,
    ) -> Result<Uuid, DispatchError> {
        let inner = &self.inner;
        let now = inner.clock.now_utc();

        if let Some(key) = &options.task_key {
            if key.len() > MAX_TASK_KEY_LEN {
                return Err(DispatchError::FieldTooLong { field: "task_key", max: MAX_TASK_KEY_LEN });
            }
        }
        if type_name.len() > MAX_TYPE_NAME_LEN {
            return Err(DispatchError::FieldTooLong { field: "type", max: MAX_TYPE_NAME_LEN });
        }

        // Fold a one-shot schedule into the recurring rule's first-run
        // settings when the rule does not pin its own.
        let recurring = options.recurring.clone().map(|mut spec| {
            match options.schedule {
                Schedule::Delayed(delay) if spec.initial_delay.is_none() && !spec.run_now => {
                    spec.initial_delay = Some(delay);
                }
                Schedule::At(when) if spec.specific_run_time.is_none() => {
                    spec.specific_run_time = Some(when);
                }
                _ => {}
            }
            spec
        });

        if let Some(spec) = &recurring {
            spec.validate()
                .map_err(|reason| DispatchError::InvalidRecurrence { reason })?;
        }

        // First-fire plan.
        let mut skipped: Vec<DateTime<Utc>> = Vec::new();
        let (status, scheduled_execution_utc, next_run_utc, fire_at) = match &recurring {
            Some(spec) => {
                let plan = spec.initial_plan(now);
                let Some(first) = plan.next_run else {
                    return Err(DispatchError::InvalidRecurrence {
                        reason: "rule yields no future occurrence".into(),
                    });
                };
                skipped = plan.skipped;
                (TaskStatus::WaitingQueue, None, Some(first), Some(first))
            }
            None => match options.schedule {
                Schedule::Immediate => (TaskStatus::Queued, None, None, None),
                Schedule::Delayed(delay) => {
                    let at = now + Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
                    (TaskStatus::WaitingQueue, Some(at), None, Some(at))
                }
                Schedule::At(when) => (TaskStatus::WaitingQueue, Some(when), None, Some(when)),
            },
        };

        let audit_level = options.audit_level.unwrap_or(inner.default_audit_level);
        let requested_queue = entry.queue().map(str::to_owned).or(options.queue.clone());
        let handler = self.resolve_strategy(&entry, &recurring, fire_at, now);

        let draft = QueuedTask {
            id: Uuid::new_v4(),
            task_key: options.task_key.clone(),
            task_type: type_name.to_string(),
            handler: entry.handler_type().to_string(),
            request,
            status,
            queue_name: requested_queue,
            audit_level,
            is_recurring: recurring.is_some(),
            recurring_task: recurring
                .as_ref()
                .map(|spec| serde_json::to_string(spec).expect("rule serializes")),
            recurring_info: recurring.as_ref().map(RecurringSpec::describe),
            created_at_utc: now,
            scheduled_execution_utc,
            next_run_utc,
            last_execution_utc: None,
            current_run_count: recurring.as_ref().map(|_| 0),
            max_runs: recurring.as_ref().and_then(|spec| spec.max_runs),
            run_until: recurring.as_ref().and_then(|spec| spec.run_until),
            exception: None,
            execution_time_ms: None,
        };

        // Idempotent registration via task key.
        if let Some(key) = &options.task_key {
            let existing = match inner.store.get_by_key(key).await {
                Ok(existing) => existing,
                Err(source) => {
                    if options.throw_if_unable_to_persist {
                        return Err(DispatchError::Persistence { id: draft.id, source });
                    }
                    error!(key = %key, error = %source, "task key lookup failed; dispatching anyway");
                    None
                }
            };
            if let Some(existing) = existing {
                match existing.status {
                    TaskStatus::InProgress => {
                        debug!(task_id = %existing.id, key = %key, "task in progress; dispatch is a no-op");
                        return Ok(existing.id);
                    }
                    TaskStatus::Queued | TaskStatus::WaitingQueue | TaskStatus::Pending => {
                        return self
                            .update_in_place(&entry, existing, draft, recurring, skipped, now, &options)
                            .await;
                    }
                    _ if existing.is_recurring => {
                        // A finished recurring task resumes under the same
                        // identity, history intact.
                        return self
                            .update_in_place(&entry, existing, draft, recurring, skipped, now, &options)
                            .await;
                    }
                    _ => {
                        // Finished one-shot: replace it.
                        if let Err(e) = inner.store.remove(existing.id).await {
                            warn!(task_id = %existing.id, error = %e, "could not remove finished task");
                        }
                    }
                }
            }
        }

        // Persist, then route.
        let mut persisted = true;
        match inner.store.persist(draft.clone()).await {
            Ok(_) => {}
            Err(StoreError::DuplicateKey { key }) => {
                // Lost a dispatch race on the same key; defer to the winner.
                if let Ok(Some(winner)) = inner.store.get_by_key(&key).await {
                    return Ok(winner.id);
                }
                persisted = false;
            }
            Err(source) => {
                if options.throw_if_unable_to_persist {
                    return Err(DispatchError::Persistence { id: draft.id, source });
                }
                error!(task_id = %draft.id, error = %source, "persistence failed; running best-effort");
                persisted = false;
            }
        }

        if persisted && !skipped.is_empty() {
            if let Err(e) = inner.store.record_skipped_occurrences(draft.id, &skipped).await {
                warn!(task_id = %draft.id, error = %e, "could not record skipped occurrences");
            }
        }

        let executor = TaskExecutor {
            task_id: draft.id,
            task_type: draft.task_type.clone(),
            request: draft.request.clone(),
            queue_name: draft.queue_name.clone(),
            audit_level,
            recurring,
            scheduled_for: fire_at,
            current_run: 0,
            persisted,
            handler,
        };

        self.route(executor, fire_at).await?;
        Ok(draft.id)
    }

    /// Update an existing keyed row in place, keeping its identity and
    /// history. A persisted future `next_run` is preserved exactly; a stale
    /// one is re-planned using it as the rhythm anchor.
    #[allow(clippy::too_many_arguments)]
    async fn update_in_place(
        &self,
        entry: &Arc<HandlerEntry>,
        existing: QueuedTask,
        mut draft: QueuedTask,
        recurring: Option<RecurringSpec>,
        mut skipped: Vec<DateTime<Utc>>,
        now: DateTime<Utc>,
        options: &DispatchOptions,
    ) -> Result<Uuid, DispatchError> {
        let inner = &self.inner;
        draft.id = existing.id;

        let mut fire_at = draft.next_fire_time();
        if let (Some(spec), Some(persisted_next)) = (&recurring, existing.next_run_utc) {
            if persisted_next > now {
                draft.next_run_utc = Some(persisted_next);
                fire_at = Some(persisted_next);
                skipped.clear();
            } else {
                let plan = spec.next_valid_run(
                    persisted_next,
                    existing.current_run_count.unwrap_or(0),
                    now,
                    DEFAULT_MAX_ITERATIONS,
                );
                skipped = plan.skipped;
                draft.next_run_utc = plan.next_run;
                fire_at = plan.next_run;
                if plan.next_run.is_none() {
                    draft.status = TaskStatus::Completed;
                }
            }
        }

        if let Err(source) = inner.store.update_task(draft.clone()).await {
            if options.throw_if_unable_to_persist {
                return Err(DispatchError::Persistence { id: draft.id, source });
            }
            error!(task_id = %draft.id, error = %source, "in-place update failed");
            return Ok(draft.id);
        }
        if !skipped.is_empty() {
            if let Err(e) = inner.store.record_skipped_occurrences(draft.id, &skipped).await {
                warn!(task_id = %draft.id, error = %e, "could not record skipped occurrences");
            }
        }

        debug!(task_id = %draft.id, "task re-registered in place");

        let handler = self.resolve_strategy(entry, &recurring, fire_at, now);
        let executor = TaskExecutor {
            task_id: draft.id,
            task_type: draft.task_type.clone(),
            request: draft.request.clone(),
            queue_name: draft.queue_name.clone(),
            audit_level: draft.audit_level,
            recurring,
            scheduled_for: fire_at,
            current_run: existing.current_run_count.unwrap_or(0),
            persisted: true,
            handler,
        };

        match draft.status {
            TaskStatus::WaitingQueue => {
                // Any stale scheduler entry dies at fire-time validation.
                self.route(executor, fire_at).await?;
            }
            TaskStatus::Queued if existing.status == TaskStatus::WaitingQueue => {
                // Moved from the wheel to immediate execution.
                self.route(executor, None).await?;
            }
            _ => {
                // Already sitting in a channel (or terminal): nothing to route.
            }
        }
        Ok(draft.id)
    }

    async fn route(
        &self,
        executor: TaskExecutor,
        fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), DispatchError> {
        match fire_at {
            Some(at) => {
                self.inner.scheduler.schedule(executor, at);
                Ok(())
            }
            None => {
                let queue = self
                    .inner
                    .queues
                    .resolve(executor.queue_name.as_deref(), executor.is_recurring());
                // Back-pressure: a full queue suspends the dispatcher here.
                queue
                    .enqueue(executor)
                    .await
                    .map_err(|_| DispatchError::ShuttingDown)
            }
        }
    }

    /// The adaptive eager/lazy rule: lazy only pays off when the handler
    /// would otherwise sit in memory for a long wait.
    fn resolve_strategy(
        &self,
        entry: &Arc<HandlerEntry>,
        recurring: &Option<RecurringSpec>,
        fire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> HandlerResolution {
        let inner = &self.inner;
        let lazy = inner.lazy_enabled
            && match recurring {
                Some(spec) => spec
                    .approx_interval(now)
                    .map(|gap| gap >= inner.lazy_recurring_threshold)
                    .unwrap_or(false),
                None => fire_at
                    .map(|at| at - now >= inner.lazy_delay_threshold)
                    .unwrap_or(false),
            };
        if lazy {
            HandlerResolution::Lazy(Arc::clone(entry))
        } else {
            HandlerResolution::Eager(entry.instantiate())
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("default_audit_level", &self.inner.default_audit_level)
            .field("lazy_enabled", &self.inner.lazy_enabled)
            .finish_non_exhaustive()
    }
}
