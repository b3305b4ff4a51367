use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::trace;

use crate::Error;

/// Cancellable handle to a single scheduled run.
pub trait ScheduledHandle: Send + Sync {
    /// Best-effort cancellation; a runnable that already fired is unaffected.
    fn cancel(&self);

    /// Whether the timer has fired and the runnable was handed off for
    /// execution. Reported from the moment of hand-off, not completion, so
    /// submissions arriving mid-execution schedule a fresh run.
    fn is_done(&self) -> bool;

    fn is_cancelled(&self) -> bool;
}

/// Executes a runnable once at a specified future instant.
pub trait Scheduler: Send + Sync {
    fn schedule(
        &self,
        at: Instant,
        runnable: BoxFuture<'static, ()>,
    ) -> Result<Arc<dyn ScheduledHandle>, Error>;
}

/// [`Scheduler`] backed by the tokio timer.
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Binds to the current runtime.
    pub fn new() -> Result<Self, Error> {
        Handle::try_current()
            .map(|handle| Self { handle })
            .map_err(|_| Error::SchedulerRejected {
                reason: "no tokio runtime available".to_string(),
            })
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

#[derive(Default)]
struct HandleState {
    fired: AtomicBool,
    cancelled: AtomicBool,
}

struct TokioScheduledHandle {
    state: Arc<HandleState>,
}

impl ScheduledHandle for TokioScheduledHandle {
    fn cancel(&self) {
        if !self.state.fired.load(Ordering::SeqCst) {
            self.state.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn is_done(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(
        &self,
        at: Instant,
        runnable: BoxFuture<'static, ()>,
    ) -> Result<Arc<dyn ScheduledHandle>, Error> {
        let state = Arc::new(HandleState::default());
        let task_state = Arc::clone(&state);
        self.handle.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
            if task_state.cancelled.load(Ordering::SeqCst) {
                trace!("scheduled run was cancelled before its deadline");
                return;
            }
            task_state.fired.store(true, Ordering::SeqCst);
            runnable.await;
        });
        Ok(Arc::new(TokioScheduledHandle { state }))
    }
}
