//! Handler registry: fully-qualified type identifier → payload codec +
//! handler factory.
//!
//! Dynamic dispatch works through a registered map, never reflection: each
//! entry knows how to decode the task type's JSON payload and how to build a
//! handler instance. The factory is invoked eagerly at dispatch or lazily at
//! execution, depending on the resolution strategy chosen per task.

use std::collections::HashMap;
use std::sync::Arc;

use crate::executor::{ErasedHandler, HandlerAdapter};
use crate::task::TaskHandler;

type ErasedFactory = Arc<dyn Fn() -> Arc<dyn ErasedHandler> + Send + Sync>;

/// One registered task type.
pub struct HandlerEntry {
    task_type: String,
    handler_type: String,
    queue: Option<String>,
    factory: ErasedFactory,
}

impl HandlerEntry {
    /// Fully-qualified payload type identifier.
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Fully-qualified handler type identifier.
    pub fn handler_type(&self) -> &str {
        &self.handler_type
    }

    /// Queue override declared by the handler type.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Build a fresh handler instance.
    pub(crate) fn instantiate(&self) -> Arc<dyn ErasedHandler> {
        (self.factory)()
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("task_type", &self.task_type)
            .field("handler_type", &self.handler_type)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Registry mapping payload type identifiers to handler entries.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Arc<HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for its task type.
    ///
    /// The factory is called once here to capture the handler's queue
    /// preference, then once per eager dispatch or lazy execution.
    ///
    /// # Panics
    ///
    /// Panics when the task type is already registered - duplicate
    /// registration is a wiring bug, not a runtime condition.
    pub fn register<H, F>(&mut self, factory: F)
    where
        H: TaskHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let task_type = std::any::type_name::<H::Task>().to_string();
        let handler_type = std::any::type_name::<H>().to_string();
        if self.entries.contains_key(&task_type) {
            panic!("handler already registered for task type: {task_type}");
        }

        let probe = factory();
        let queue = probe.queue().map(str::to_owned);
        drop(probe);

        let erased: ErasedFactory =
            Arc::new(move || Arc::new(HandlerAdapter::new(factory())) as Arc<dyn ErasedHandler>);

        self.entries.insert(
            task_type.clone(),
            Arc::new(HandlerEntry { task_type, handler_type, queue, factory: erased }),
        );
    }

    pub fn resolve(&self, task_type: &str) -> Option<Arc<HandlerEntry>> {
        self.entries.get(task_type).cloned()
    }

    pub fn has(&self, task_type: &str) -> bool {
        self.entries.contains_key(task_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        message: String,
    }

    struct PingHandler;

    #[async_trait]
    impl TaskHandler for PingHandler {
        type Task = Ping;

        async fn handle(&self, _task: Ping, _ctx: &TaskContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn queue(&self) -> Option<&str> {
            Some("pings")
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register::<PingHandler, _>(|| PingHandler);

        let task_type = std::any::type_name::<Ping>();
        assert!(registry.has(task_type));
        assert_eq!(registry.len(), 1);

        let entry = registry.resolve(task_type).unwrap();
        assert_eq!(entry.task_type(), task_type);
        assert_eq!(entry.handler_type(), std::any::type_name::<PingHandler>());
        assert_eq!(entry.queue(), Some("pings"));

        assert!(registry.resolve("unknown::Type").is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register::<PingHandler, _>(|| PingHandler);
        registry.register::<PingHandler, _>(|| PingHandler);
    }
}
