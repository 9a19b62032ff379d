//! Cancellation registry and pre-start blacklist.
//!
//! Two structures cover the two halves of task cancellation:
//!
//! - [`CancellationRegistry`] maps the id of every in-progress task to its
//!   cancellation token. Cancelling through the registry triggers the token
//!   the handler is observing.
//! - [`Blacklist`] holds ids cancelled *before* they started. No token is
//!   ever created for them; workers and the scheduler discard blacklisted
//!   tasks on sight.

use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// taskId → cancellation handle for in-flight executions.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_id: Uuid, token: CancellationToken) {
        self.tokens.insert(task_id, token);
    }

    pub fn remove(&self, task_id: Uuid) {
        self.tokens.remove(&task_id);
    }

    /// Trigger the token for an in-flight task. Returns false when the task
    /// is not currently executing.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.tokens.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: Uuid) -> bool {
        self.tokens.contains_key(&task_id)
    }

    /// Ids of every task currently holding a token.
    pub fn active_ids(&self) -> Vec<Uuid> {
        self.tokens.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Ids cancelled before their execution started.
#[derive(Default)]
pub struct Blacklist {
    ids: DashSet<Uuid>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_id: Uuid) {
        self.ids.insert(task_id);
    }

    pub fn contains(&self, task_id: Uuid) -> bool {
        self.ids.contains(&task_id)
    }

    /// Remove and report whether the id was present. Workers call this on
    /// pickup so an id is consumed by exactly one discard.
    pub fn take(&self, task_id: Uuid) -> bool {
        self.ids.remove(&task_id).is_some()
    }
}
