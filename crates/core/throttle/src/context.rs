use std::any::Any;
use std::sync::Arc;

/// Opaque snapshot of the ambient execution context.
pub type ContextSnapshot = Arc<dyn Any + Send + Sync>;

/// Moves the caller's ambient context (security principal, tenant, locale)
/// onto the scheduler thread for the duration of a task execution.
///
/// The snapshot is captured when a task is merged and restored immediately
/// before the task runs; it must be cleared right after so nothing leaks to
/// unrelated executions on a pooled thread.
pub trait ContextPropagator: Send + Sync {
    fn capture(&self) -> ContextSnapshot;

    fn restore(&self, snapshot: &ContextSnapshot);

    fn clear(&self);
}

/// Propagator for deployments without an ambient context.
pub struct NoopContext;

impl ContextPropagator for NoopContext {
    fn capture(&self) -> ContextSnapshot {
        Arc::new(())
    }

    fn restore(&self, _snapshot: &ContextSnapshot) {}

    fn clear(&self) {}
}
