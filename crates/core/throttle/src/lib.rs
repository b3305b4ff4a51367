//! Debounce/throttle coordination for expensive, side-effecting operations.
//!
//! Rapid submissions for the same key collapse onto a single delayed
//! execution; every caller receives a shared, cancellable [`ThrottledFuture`].

mod config;
mod context;
mod error;
mod future;
mod key;
mod scheduler;
mod service;

pub use config::ThrottleConfig;
pub use context::{ContextPropagator, ContextSnapshot, NoopContext};
pub use error::Error;
pub use future::{Callback, ThrottledFuture};
pub use key::{GroupBuilder, KeyBuilder};
pub use scheduler::{ScheduledHandle, Scheduler, TokioScheduler};
pub use service::{ThrottleRequest, ThrottleService};
