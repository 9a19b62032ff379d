//! Named bounded queues and the queue manager.
//!
//! Each [`WorkerQueue`] is a bounded channel with its own worker pool and
//! degree of parallelism; queues are independent of each other. The manager
//! always holds a `default` and a `recurring` queue; additional queues are
//! declared at configuration time.
//!
//! Enqueueing into a full queue suspends the caller - that is the engine's
//! back-pressure: an immediate dispatch may park in `enqueue` until a worker
//! drains the channel. Scheduled tasks never hit this path because they wait
//! in the scheduler's heap, not the channel.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::executor::TaskExecutor;

/// Name of the queue used when nothing else is requested.
pub const DEFAULT_QUEUE: &str = "default";

/// Name of the queue recurring tasks route to by default.
pub const RECURRING_QUEUE: &str = "recurring";

/// Per-queue tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Bounded channel capacity; writers suspend beyond it.
    pub capacity: usize,
    /// Worker-pool size. `1` gives strict sequential ordering.
    pub max_parallelism: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self { capacity: 500, max_parallelism: 1 }
    }
}

impl QueueOptions {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.max_parallelism = n.max(1);
        self
    }
}

/// The queue is shut down and no longer accepts work.
#[derive(Debug, Error)]
#[error("queue {name} is closed")]
pub struct QueueClosed {
    pub name: String,
}

/// One named bounded queue. The receiving half is taken exactly once by the
/// queue's pump when the engine starts.
pub struct WorkerQueue {
    name: String,
    options: QueueOptions,
    tx: mpsc::Sender<TaskExecutor>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<TaskExecutor>>>,
}

impl WorkerQueue {
    fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        Self {
            name: name.into(),
            options,
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> QueueOptions {
        self.options
    }

    /// Items currently buffered in the channel.
    pub fn count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Push an executor, suspending when the queue is at capacity.
    pub(crate) async fn enqueue(&self, executor: TaskExecutor) -> Result<(), QueueClosed> {
        self.tx
            .send(executor)
            .await
            .map_err(|_| QueueClosed { name: self.name.clone() })
    }

    /// Hand the receiving half to the pump. Returns `None` on a second call.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<TaskExecutor>> {
        self.rx.lock().expect("queue receiver poisoned").take()
    }
}

impl std::fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Ordered map of queue name → queue. Built once at engine construction;
/// immutable afterwards.
pub struct QueueManager {
    queues: HashMap<String, Arc<WorkerQueue>>,
}

impl QueueManager {
    pub(crate) fn new(
        default_options: QueueOptions,
        recurring_options: QueueOptions,
        named: HashMap<String, QueueOptions>,
    ) -> Self {
        let mut queues = HashMap::new();
        queues.insert(
            DEFAULT_QUEUE.to_string(),
            Arc::new(WorkerQueue::new(DEFAULT_QUEUE, default_options)),
        );
        queues.insert(
            RECURRING_QUEUE.to_string(),
            Arc::new(WorkerQueue::new(RECURRING_QUEUE, recurring_options)),
        );
        for (name, options) in named {
            queues
                .entry(name.clone())
                .or_insert_with(|| Arc::new(WorkerQueue::new(name, options)));
        }
        Self { queues }
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkerQueue>> {
        self.queues.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    pub(crate) fn all(&self) -> impl Iterator<Item = &Arc<WorkerQueue>> {
        self.queues.values()
    }

    /// Pick the queue for a task: the requested name when it exists,
    /// otherwise `recurring` for recurring tasks, otherwise `default`.
    /// A request for a queue that was never configured falls back to
    /// `default` and is recorded, not treated as an error.
    pub(crate) fn resolve(&self, requested: Option<&str>, is_recurring: bool) -> Arc<WorkerQueue> {
        if let Some(name) = requested {
            if let Some(queue) = self.queues.get(name) {
                return Arc::clone(queue);
            }
            warn!(queue = name, "queue not configured; falling back to default");
            return Arc::clone(&self.queues[DEFAULT_QUEUE]);
        }
        if is_recurring {
            return Arc::clone(&self.queues[RECURRING_QUEUE]);
        }
        Arc::clone(&self.queues[DEFAULT_QUEUE])
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.names())
            .finish()
    }
}
