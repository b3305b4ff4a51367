use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch::{channel as watch_channel, Receiver, Sender};
use tracing::warn;

use crate::Error;

/// Callback invoked with the eventual result of a [`ThrottledFuture`].
pub type Callback<T> = Box<dyn FnOnce(Result<Arc<T>, Error>) + Send + 'static>;

type Completion<T> = Option<Result<Arc<T>, Error>>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Pending,
    Running,
    Done,
    Cancelled,
}

struct Inner<T> {
    state: State,
    /// Replaceable until the future starts running.
    task: Option<BoxFuture<'static, Result<T, Error>>>,
    /// Additive across task replacements.
    callbacks: Vec<Callback<T>>,
    result: Option<Result<Arc<T>, Error>>,
    /// Last known good value, served by [`ThrottledFuture::get_now`] while a
    /// fresher computation is still pending.
    cached: Option<Arc<T>>,
    started_at: Option<Instant>,
}

/// A future whose task can be replaced before it starts running, merging
/// multiple submissions into one execution.
///
/// Exactly one owner transitions it from pending to running; waiters observe
/// completion through a watch channel and never hold the inner lock while the
/// task executes.
pub struct ThrottledFuture<T> {
    inner: Mutex<Inner<T>>,
    sender: Sender<Completion<T>>,
    receiver: Receiver<Completion<T>>,
}

impl<T> fmt::Debug for ThrottledFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledFuture")
            .field("state", &self.inner.lock().unwrap().state)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> ThrottledFuture<T> {
    fn with_state(
        state: State,
        task: Option<BoxFuture<'static, Result<T, Error>>>,
        callbacks: Vec<Callback<T>>,
        completion: Completion<T>,
    ) -> Arc<Self> {
        let (sender, receiver) = watch_channel(completion.clone());
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state,
                task,
                callbacks,
                result: completion,
                cached: None,
                started_at: None,
            }),
            sender,
            receiver,
        })
    }

    /// Pending future holding the given task.
    pub fn of<F>(task: F) -> Arc<Self>
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self::of_boxed(task.boxed(), Vec::new())
    }

    pub(crate) fn of_boxed(
        task: BoxFuture<'static, Result<T, Error>>,
        callbacks: Vec<Callback<T>>,
    ) -> Arc<Self> {
        Self::with_state(State::Pending, Some(task), callbacks, None)
    }

    /// Already-completed future.
    pub fn done(value: T) -> Arc<Self> {
        Self::with_state(State::Done, None, Vec::new(), Some(Ok(Arc::new(value))))
    }

    /// Future that completed with an error.
    pub fn failed(error: Error) -> Arc<Self> {
        Self::with_state(State::Done, None, Vec::new(), Some(Err(error)))
    }

    /// Already-cancelled future.
    pub fn cancelled() -> Arc<Self> {
        Self::with_state(State::Cancelled, None, Vec::new(), Some(Err(Error::Cancelled)))
    }

    /// Merges a new task into this future.
    ///
    /// While still pending the task is replaced in place (only the latest one
    /// survives), the callbacks are appended and `self` is returned. Once
    /// running, done or cancelled a fresh pending future built from the
    /// arguments is returned instead; the caller must publish it as the live
    /// one for its key.
    pub fn update<F>(self: &Arc<Self>, task: F, callbacks: Vec<Callback<T>>) -> Arc<Self>
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.update_boxed(task.boxed(), callbacks)
    }

    pub(crate) fn update_boxed(
        self: &Arc<Self>,
        task: BoxFuture<'static, Result<T, Error>>,
        mut callbacks: Vec<Callback<T>>,
    ) -> Arc<Self> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Pending {
            inner.task = Some(task);
            inner.callbacks.append(&mut callbacks);
            drop(inner);
            Arc::clone(self)
        } else {
            drop(inner);
            Self::of_boxed(task, callbacks)
        }
    }

    /// Moves this future's task and callbacks onto `target` under the same
    /// pending/not-pending rule as [`ThrottledFuture::update`], then clears
    /// this future, leaving it cancelled.
    pub fn transfer(self: &Arc<Self>, target: &Arc<Self>) -> Arc<Self> {
        let moved = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Pending {
                inner.state = State::Cancelled;
                Some((inner.task.take(), std::mem::take(&mut inner.callbacks)))
            } else {
                None
            }
        };
        let Some((task, callbacks)) = moved else {
            return Arc::clone(target);
        };
        self.sender.send_modify(|slot| {
            slot.replace(Err(Error::Cancelled));
        });
        match task {
            Some(task) => target.update_boxed(task, callbacks),
            None => {
                let mut inner = target.inner.lock().unwrap();
                if inner.state == State::Pending {
                    inner.callbacks.extend(callbacks);
                }
                drop(inner);
                Arc::clone(target)
            }
        }
    }

    /// Executes the current task exactly once.
    ///
    /// Idempotent: a future that is already running, done or cancelled is
    /// left untouched. The inner lock guards only the pending-to-running
    /// transition; the task itself executes without it, so `is_running` and
    /// `get_now` stay observable throughout.
    pub async fn run<F>(&self, on_start: F)
    where
        F: FnOnce(Instant) + Send,
    {
        let (task, started) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Pending {
                return;
            }
            inner.state = State::Running;
            let started = Instant::now();
            inner.started_at = Some(started);
            (inner.task.take(), started)
        };
        on_start(started);
        let result = match task {
            Some(task) => task.await.map(Arc::new),
            None => Err(Error::Cancelled),
        };
        self.complete(result);
    }

    fn complete(&self, result: Result<Arc<T>, Error>) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            // a cancellation that raced the run wins; the result is discarded
            if inner.state == State::Cancelled {
                return;
            }
            inner.state = State::Done;
            inner.result = Some(result.clone());
            std::mem::take(&mut inner.callbacks)
        };
        self.sender.send_modify(|slot| {
            slot.replace(result.clone());
        });
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(result.clone()))).is_err() {
                warn!("completion callback panicked");
            }
        }
    }

    /// Cooperative cancellation; a task that is already executing is not
    /// interrupted, but its eventual result is discarded.
    pub fn cancel(&self) {
        let transitioned = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                State::Pending | State::Running => {
                    inner.state = State::Cancelled;
                    inner.task = None;
                    inner.callbacks.clear();
                    true
                }
                State::Done | State::Cancelled => false,
            }
        };
        if transitioned {
            self.sender.send_modify(|slot| {
                slot.replace(Err(Error::Cancelled));
            });
        }
    }

    /// Waits until the future is done or cancelled.
    pub async fn get(&self) -> Result<Arc<T>, Error> {
        let mut receiver = self.receiver.clone();
        receiver
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| Error::RecvError)
            .and_then(|slot| slot.clone().unwrap())
    }

    /// Like [`ThrottledFuture::get`] but gives up after `timeout`.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<Arc<T>, Error> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Immediate, non-blocking value: the completed result when the future
    /// finished successfully, otherwise the cached value if one was set.
    pub fn get_now(&self) -> Option<Arc<T>> {
        let inner = self.inner.lock().unwrap();
        match (inner.state, &inner.result) {
            (State::Done, Some(Ok(value))) => Some(Arc::clone(value)),
            _ => inner.cached.clone(),
        }
    }

    /// Sets the fallback value served by [`ThrottledFuture::get_now`] while
    /// no fresh result is available.
    pub fn set_cached_result(&self, value: Option<Arc<T>>) {
        self.inner.lock().unwrap().cached = value;
    }

    /// Registers a callback to run with the eventual result. Runs
    /// synchronously right away when the future already completed; dropped
    /// when the future was cancelled.
    pub fn then<F>(&self, callback: F)
    where
        F: FnOnce(Result<Arc<T>, Error>) + Send + 'static,
    {
        let result = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                State::Pending | State::Running => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
                State::Cancelled => return,
                State::Done => inner.result.clone(),
            }
        };
        if let Some(result) = result {
            callback(result);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().state == State::Running
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().state == State::Done
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().state == State::Cancelled
    }

    /// Instant at which execution started, once it has.
    pub fn started_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap().started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn run_executes_the_task_exactly_once() {
        let executions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executions);
        let future = ThrottledFuture::of(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("done".to_string())
        });

        future.run(|_| {}).await;
        let first_start = future.started_at();
        future.run(|_| {}).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(future.started_at(), first_start);
        assert_eq!(*future.get().await.unwrap(), "done");
    }

    #[test]
    fn debug_output_reports_the_state() {
        let future = ThrottledFuture::done("value".to_string());
        assert!(format!("{future:?}").contains("Done"));
    }

    #[tokio::test]
    async fn update_replaces_the_task_while_pending() {
        let future = ThrottledFuture::of(async { Ok("first".to_string()) });
        let merged = future.update(async { Ok("second".to_string()) }, Vec::new());

        assert!(Arc::ptr_eq(&future, &merged));
        merged.run(|_| {}).await;
        assert_eq!(*merged.get().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn update_after_completion_returns_a_fresh_future() {
        let future = ThrottledFuture::of(async { Ok("first".to_string()) });
        future.run(|_| {}).await;

        let fresh = future.update(async { Ok("second".to_string()) }, Vec::new());
        assert!(!Arc::ptr_eq(&future, &fresh));
        fresh.run(|_| {}).await;
        assert_eq!(*fresh.get().await.unwrap(), "second");
        assert_eq!(*future.get().await.unwrap(), "first");
    }

    #[tokio::test]
    async fn transfer_moves_task_and_callbacks_onto_the_target() {
        let notified = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&notified);
        let source = ThrottledFuture::of(async { Ok("source".to_string()) });
        source.then(move |_| {
            flag.store(true, Ordering::SeqCst);
        });
        let target = ThrottledFuture::of(async { Ok("target".to_string()) });

        let merged = source.transfer(&target);
        assert!(Arc::ptr_eq(&merged, &target));
        assert!(source.is_cancelled());

        merged.run(|_| {}).await;
        assert_eq!(*merged.get().await.unwrap(), "source");
        assert!(notified.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_prevents_a_pending_task_from_starting() {
        let executions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executions);
        let future = ThrottledFuture::of(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("never".to_string())
        });

        future.cancel();
        future.run(|_| {}).await;

        assert_eq!(executions.load(Ordering::SeqCst), 0);
        assert!(future.is_cancelled());
        assert_eq!(future.get().await, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn get_now_serves_the_cache_until_a_fresh_result_exists() {
        let future = ThrottledFuture::of(async { Ok("fresh".to_string()) });
        future.set_cached_result(Some(Arc::new("stale".to_string())));

        assert_eq!(future.get_now().as_deref(), Some(&"stale".to_string()));
        future.run(|_| {}).await;
        assert_eq!(future.get_now().as_deref(), Some(&"fresh".to_string()));
    }

    #[tokio::test]
    async fn get_now_falls_back_to_the_cache_after_cancellation() {
        let future = ThrottledFuture::<String>::of(async { Ok("fresh".to_string()) });
        future.set_cached_result(Some(Arc::new("stale".to_string())));
        future.cancel();

        assert_eq!(future.get_now().as_deref(), Some(&"stale".to_string()));
    }

    #[tokio::test]
    async fn then_runs_synchronously_on_a_completed_future() {
        let future = ThrottledFuture::done("value".to_string());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        future.then(move |result| {
            assert_eq!(*result.unwrap(), "value");
            flag.store(true, Ordering::SeqCst);
        });
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn then_is_dropped_on_a_cancelled_future() {
        let future = ThrottledFuture::<String>::cancelled();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        future.then(move |_| {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stop_the_others() {
        let future = ThrottledFuture::of(async { Ok("value".to_string()) });
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        future.then(|_| panic!("broken callback"));
        future.then(move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        future.run(|_| {}).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_future_surfaces_the_error() {
        let future = ThrottledFuture::<String>::failed(Error::task("boom"));
        assert!(matches!(
            future.get().await,
            Err(Error::TaskFailed { .. })
        ));
        assert_eq!(future.get_now(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn get_timeout_elapses_on_a_future_that_never_runs() {
        let future = ThrottledFuture::of(async { Ok("never".to_string()) });
        let result = future.get_timeout(Duration::from_secs(5)).await;
        assert_eq!(result, Err(Error::Timeout));
    }
}
