//! Time-ordered set of tasks waiting for a future fire time.
//!
//! The default shape is a single min-heap drained by one tick fibre on a
//! short-period timer. The sharded variant is the same contract spread over
//! `k` independent heaps (assignment by task-id hash) with `k` tick fibres,
//! which removes contention on one lock when thousands of `schedule` calls
//! land in a narrow window. Externally observable behavior is identical.
//!
//! Cancellation is lazy: the scheduler may still drain a cancelled entry;
//! the blacklist check at pickup discards it. Firing re-validates against
//! the store (see the engine's fire path), so superseded entries - a task
//! re-registered under its key with a new schedule - fall out harmlessly.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::Clock;
use crate::executor::TaskExecutor;

/// Default tick period of the scheduler fibres.
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// Receives due executors from the scheduler fibres.
#[async_trait]
pub(crate) trait FireTarget: Send + Sync + 'static {
    async fn fire(&self, executor: TaskExecutor);
}

struct Entry {
    fire_at: DateTime<Utc>,
    /// Insertion sequence; breaks fire-time ties FIFO.
    seq: u64,
    executor: TaskExecutor,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest (fire_at, seq) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.fire_at, other.seq).cmp(&(self.fire_at, self.seq))
    }
}

struct Shard {
    heap: Mutex<BinaryHeap<Entry>>,
}

impl Shard {
    fn new() -> Self {
        Self { heap: Mutex::new(BinaryHeap::new()) }
    }

    fn push(&self, entry: Entry) {
        self.heap.lock().expect("scheduler heap poisoned").push(entry);
    }

    /// Pop every entry due at or before `now`, preserving heap order.
    fn pop_due(&self, now: DateTime<Utc>) -> Vec<Entry> {
        let mut heap = self.heap.lock().expect("scheduler heap poisoned");
        let mut due = Vec::new();
        while heap.peek().map(|e| e.fire_at <= now).unwrap_or(false) {
            due.push(heap.pop().expect("peeked entry vanished"));
        }
        due
    }

    fn len(&self) -> usize {
        self.heap.lock().expect("scheduler heap poisoned").len()
    }
}

/// Min-heap scheduler; one shard by default, `k` when sharded.
pub struct Scheduler {
    shards: Arc<Vec<Shard>>,
    tick: Duration,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new(shard_count: usize, tick: Duration, clock: Arc<dyn Clock>) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: Arc::new((0..shard_count).map(|_| Shard::new()).collect()),
            tick,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Entries currently waiting across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an executor to fire at `at`. Entries already due fire on the
    /// next tick.
    pub(crate) fn schedule(&self, executor: TaskExecutor, at: DateTime<Utc>) {
        let shard_index = (executor.task_id.as_u128() % self.shards.len() as u128) as usize;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = %executor.task_id, fire_at = %at, shard = shard_index, "task scheduled");
        self.shards[shard_index].push(Entry { fire_at: at, seq, executor });
    }

    /// Spawn one tick fibre per shard. Fibres exit when `shutdown` fires.
    pub(crate) fn start(
        &self,
        target: Arc<dyn FireTarget>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..self.shards.len())
            .map(|shard_index| {
                let shards = Arc::clone(&self.shards);
                let clock = Arc::clone(&self.clock);
                let tick = self.tick;
                let target = Arc::clone(&target);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(tick);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticker.tick() => {}
                        }
                        let now = clock.now_utc();
                        for entry in shards[shard_index].pop_due(now) {
                            target.fire(entry.executor).await;
                        }
                    }
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("shards", &self.shards.len())
            .field("tick", &self.tick)
            .field("waiting", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::executor::HandlerResolution;
    use crate::model::AuditLevel;
    use crate::registry::HandlerRegistry;
    use crate::task::{TaskContext, TaskHandler};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Noop;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        type Task = Noop;

        async fn handle(&self, _task: Noop, _ctx: &TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn executor() -> TaskExecutor {
        let mut registry = HandlerRegistry::new();
        registry.register::<NoopHandler, _>(|| NoopHandler);
        let entry = registry.resolve(std::any::type_name::<Noop>()).unwrap();
        TaskExecutor {
            task_id: Uuid::new_v4(),
            task_type: std::any::type_name::<Noop>().into(),
            request: "null".into(),
            queue_name: None,
            audit_level: AuditLevel::Full,
            recurring: None,
            scheduled_for: None,
            current_run: 0,
            persisted: true,
            handler: HandlerResolution::Lazy(entry),
        }
    }

    struct Recorder {
        fired: Mutex<Vec<Uuid>>,
        notify: tokio::sync::Notify,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self { fired: Mutex::new(Vec::new()), notify: tokio::sync::Notify::new() })
        }

        fn fired(&self) -> Vec<Uuid> {
            self.fired.lock().unwrap().clone()
        }

        async fn wait_for(&self, count: usize, budget: Duration) {
            let deadline = tokio::time::Instant::now() + budget;
            while self.fired.lock().unwrap().len() < count {
                if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                    break;
                }
            }
        }
    }

    #[async_trait]
    impl FireTarget for Recorder {
        async fn fire(&self, executor: TaskExecutor) {
            self.fired.lock().unwrap().push(executor.task_id);
            self.notify.notify_waiters();
        }
    }

    fn scheduler(shards: usize) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            shards,
            Duration::from_millis(20),
            Arc::new(SystemClock),
        ))
    }

    #[tokio::test]
    async fn test_due_entries_fire() {
        let scheduler = scheduler(1);
        let recorder = Recorder::new();
        let shutdown = CancellationToken::new();
        let handles = scheduler.start(recorder.clone(), shutdown.clone());

        let ex = executor();
        let id = ex.task_id;
        scheduler.schedule(ex, Utc::now() + chrono::Duration::milliseconds(50));

        recorder.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(recorder.fired(), vec![id]);
        assert!(scheduler.is_empty());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_same_fire_time_is_fifo_by_insertion() {
        let scheduler = scheduler(1);
        let recorder = Recorder::new();
        let shutdown = CancellationToken::new();

        let at = Utc::now() + chrono::Duration::milliseconds(40);
        let mut expected = Vec::new();
        for _ in 0..5 {
            let ex = executor();
            expected.push(ex.task_id);
            scheduler.schedule(ex, at);
        }

        let handles = scheduler.start(recorder.clone(), shutdown.clone());
        recorder.wait_for(5, Duration::from_secs(2)).await;
        assert_eq!(recorder.fired(), expected);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_earlier_entries_fire_first() {
        let scheduler = scheduler(1);
        let recorder = Recorder::new();
        let shutdown = CancellationToken::new();

        let late = executor();
        let early = executor();
        let (late_id, early_id) = (late.task_id, early.task_id);
        scheduler.schedule(late, Utc::now() + chrono::Duration::milliseconds(80));
        scheduler.schedule(early, Utc::now() + chrono::Duration::milliseconds(30));

        let handles = scheduler.start(recorder.clone(), shutdown.clone());
        recorder.wait_for(2, Duration::from_secs(2)).await;
        assert_eq!(recorder.fired(), vec![early_id, late_id]);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sharded_variant_fires_everything() {
        let scheduler = scheduler(4);
        assert_eq!(scheduler.shard_count(), 4);

        let recorder = Recorder::new();
        let shutdown = CancellationToken::new();
        let handles = scheduler.start(recorder.clone(), shutdown.clone());

        let count = 32;
        let mut ids: Vec<Uuid> = Vec::new();
        for _ in 0..count {
            let ex = executor();
            ids.push(ex.task_id);
            scheduler.schedule(ex, Utc::now());
        }

        recorder.wait_for(count, Duration::from_secs(3)).await;
        let mut fired = recorder.fired();
        fired.sort();
        ids.sort();
        assert_eq!(fired, ids);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_future_entries_wait() {
        let scheduler = scheduler(1);
        let recorder = Recorder::new();
        let shutdown = CancellationToken::new();
        let handles = scheduler.start(recorder.clone(), shutdown.clone());

        scheduler.schedule(executor(), Utc::now() + chrono::Duration::seconds(60));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(recorder.fired().is_empty());
        assert_eq!(scheduler.len(), 1);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
