//! Runtime - handler registry and dispatch by [`TaskType`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{HandlerError, Outcome, TaskEnvelope, TaskType};
use crate::typed::{Handler, Payload, TypedHandler};

/// A handler for one task type.
///
/// Takes the whole envelope so the handler can decode the payload as it
/// likes. Returning `Ok(Outcome::failure(..))` and `Err(HandlerError)` both
/// fail the attempt; only the error can mark it permanent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<Outcome, HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task type '{0}' is already registered")]
    AlreadyRegistered(TaskType),
}

/// Registry of handlers (task_type -> handler).
///
/// Built during initialization (mutable), shared read-only afterwards, so no
/// lock is needed at dispatch time.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Registers a typed handler under its payload's `TYPE`.
    pub fn register_typed<T: Payload, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register(T::TYPE, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type)
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    /// Registered types in declaration order of [`TaskType`].
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runtime executes a `TaskEnvelope` by dispatching to a registered handler.
pub struct Runtime {
    registry: Arc<HandlerRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute one envelope. A missing handler is a permanent error: retrying
    /// on this process would hit the same registry.
    pub async fn execute(&self, envelope: &TaskEnvelope) -> Result<Outcome, HandlerError> {
        let task_type = envelope.task_type();
        let Some(handler) = self.registry.get(task_type) else {
            return Err(HandlerError::permanent(format!(
                "no handler registered for task type {task_type}"
            )));
        };
        handler.handle(envelope).await
    }
}
