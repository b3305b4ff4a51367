use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task_local;
use tracing::{debug, trace, warn};

use crate::context::{ContextPropagator, ContextSnapshot, NoopContext};
use crate::future::ThrottledFuture;
use crate::scheduler::{ScheduledHandle, Scheduler};
use crate::{Error, ThrottleConfig};

task_local! {
    /// Marks tasks currently executing under the coordinator so that nested
    /// submissions run inline instead of being re-debounced.
    static INSIDE_THROTTLED_RUN: bool;
}

#[derive(Clone, PartialEq, Eq, Debug)]
/// Declarative throttle request for one submission.
pub struct ThrottleRequest {
    /// Deduplication key; equal keys are the same debounced unit of work
    pub key: String,
    /// Hierarchical cancellation group, may be empty
    pub group: String,
    /// When set, cancels every scheduled run with key at or after this prefix
    pub clear_group: Option<String>,
}

impl ThrottleRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            group: String::new(),
            clear_group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_clear_group(mut self, clear_group: impl Into<String>) -> Self {
        self.clear_group = Some(clear_group.into());
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.key.trim().is_empty() {
            return Err(Error::InvalidConfiguration {
                reason: "throttle key must not be blank".to_string(),
            });
        }
        if let Some(clear_group) = &self.clear_group {
            if clear_group.trim().is_empty() {
                return Err(Error::InvalidConfiguration {
                    reason: "clear group must not be blank".to_string(),
                });
            }
        }
        Ok(())
    }
}

struct ScheduledEntry {
    group: String,
    handle: Arc<dyn ScheduledHandle>,
}

impl ScheduledEntry {
    fn is_live(&self) -> bool {
        !self.handle.is_done() && !self.handle.is_cancelled()
    }
}

struct State<T> {
    /// Live future per key; merged into until its run starts.
    pending: HashMap<String, Arc<ThrottledFuture<T>>>,
    last_run: HashMap<String, Instant>,
    /// Ordered by key so that the covering coarser entry and whole group
    /// ranges can be found.
    scheduled: BTreeMap<String, ScheduledEntry>,
    /// Context snapshot captured at the most recent merge per key.
    contexts: HashMap<String, ContextSnapshot>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            last_run: HashMap::new(),
            scheduled: BTreeMap::new(),
            contexts: HashMap::new(),
        }
    }
}

/// Coalesces rapid submissions of an expensive operation into a single
/// delayed execution per key.
///
/// All decision logic runs under one coordinator lock; task execution happens
/// on the scheduler's task, outside that lock.
pub struct ThrottleService<T> {
    config: Arc<ThrottleConfig>,
    scheduler: Arc<dyn Scheduler>,
    context: Arc<dyn ContextPropagator>,
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for ThrottleService<T> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            scheduler: Arc::clone(&self.scheduler),
            context: Arc::clone(&self.context),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + Sync + 'static> ThrottleService<T> {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_config(ThrottleConfig::default(), scheduler)
    }

    pub fn from_config(config: ThrottleConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            config: Arc::new(config),
            scheduler,
            context: Arc::new(NoopContext),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn with_context(mut self, context: Arc<dyn ContextPropagator>) -> Self {
        self.context = context;
        self
    }

    /// Submits a task for debounced execution under `request.key`.
    ///
    /// Returns the shared live future for the key immediately; the last task
    /// merged before the scheduled run starts is the one that executes.
    /// Callers that do not care about the result simply drop the handle.
    pub async fn submit<F>(
        &self,
        request: ThrottleRequest,
        task: F,
    ) -> Result<Arc<ThrottledFuture<T>>, Error>
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        request.validate()?;

        // A task already running under this coordinator executes nested
        // submissions inline; scheduling them would re-debounce recursively.
        if INSIDE_THROTTLED_RUN.try_with(|inside| *inside).unwrap_or(false) {
            let future = ThrottledFuture::of(task);
            future.run(|_| {}).await;
            return Ok(future);
        }

        let snapshot = self.context.capture();
        let task = task.boxed();
        let mut state = self.state.lock().unwrap();

        // Coarser group prefixes sort before their extensions, so a pending
        // coarser-grained run covering this request is the nearest entry
        // below the key. Plain key ordering, no prefix containment.
        if let Some((covering, entry)) = state
            .scheduled
            .range::<String, _>(..&request.key)
            .next_back()
        {
            if !entry.group.trim().is_empty() && entry.is_live() {
                debug!(key = %request.key, %covering, "covered by a pending coarser run");
                return Ok(ThrottledFuture::cancelled());
            }
        }

        // The key fired within the debounce window; restart its timer.
        let within_window = state
            .last_run
            .get(&request.key)
            .is_some_and(|last| last.elapsed() < self.config.threshold);
        if within_window {
            if let Some(entry) = state.scheduled.remove(&request.key) {
                trace!(key = %request.key, "debounce timer restarted");
                entry.handle.cancel();
            }
        }

        // Merge into the live future for this key. If that future already
        // started, `update_boxed` hands back a fresh pending one instead.
        let future = match state.pending.get(&request.key) {
            Some(live) => live.update_boxed(task, Vec::new()),
            None => ThrottledFuture::of_boxed(task, Vec::new()),
        };
        state.pending.insert(request.key.clone(), Arc::clone(&future));
        state.contexts.insert(request.key.clone(), snapshot);

        if let Some(clear_group) = &request.clear_group {
            let cleared = state.scheduled.split_off(clear_group.as_str());
            for (key, entry) in cleared {
                if key == request.key {
                    // never cancel the run this submission is about to schedule
                    state.scheduled.insert(key, entry);
                    continue;
                }
                debug!(%key, %clear_group, "cancelling superseded scheduled run");
                entry.handle.cancel();
                if let Some(live) = state.pending.remove(&key) {
                    live.cancel();
                }
                state.contexts.remove(&key);
            }
        }

        let needs_schedule = state
            .scheduled
            .get(&request.key)
            .map_or(true, |entry| !entry.is_live());
        if needs_schedule {
            let at = Instant::now() + self.config.threshold;
            let handle = self.scheduler.schedule(at, self.runner(request.key.clone()))?;
            state.scheduled.insert(
                request.key.clone(),
                ScheduledEntry {
                    group: request.group.clone(),
                    handle,
                },
            );
            trace!(key = %request.key, threshold = ?self.config.threshold, "scheduled throttled run");
        }

        Ok(future)
    }

    fn runner(&self, key: String) -> BoxFuture<'static, ()> {
        let service = self.clone();
        async move { service.run_throttled(key).await }.boxed()
    }

    async fn run_throttled(&self, key: String) {
        let (future, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let Some(future) = state.pending.get(&key).map(Arc::clone) else {
                return;
            };
            if future.is_done() || future.is_cancelled() {
                return;
            }
            state.last_run.insert(key.clone(), Instant::now());
            (future, state.contexts.remove(&key))
        };

        INSIDE_THROTTLED_RUN
            .scope(true, async {
                if let Some(snapshot) = &snapshot {
                    self.context.restore(snapshot);
                }
                let state = Arc::clone(&self.state);
                let started_key = key.clone();
                future
                    .run(move |started| {
                        state.lock().unwrap().last_run.insert(started_key, started);
                    })
                    .await;
                self.context.clear();
            })
            .await;

        match future.get().await {
            Ok(_) => debug!(%key, "throttled task completed"),
            Err(Error::Cancelled) => debug!(%key, "throttled task was cancelled"),
            Err(error) => warn!(%key, %error, "throttled task failed"),
        }

        let mut state = self.state.lock().unwrap();
        let ran_live = state
            .pending
            .get(&key)
            .map_or(false, |live| Arc::ptr_eq(live, &future));
        if ran_live {
            state.pending.remove(&key);
        }
        let fired = state
            .scheduled
            .get(&key)
            .map_or(false, |entry| entry.handle.is_done());
        if fired {
            state.scheduled.remove(&key);
        }
    }

    /// Number of keys with a live, not-yet-run future.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Number of keys with an outstanding scheduled run.
    pub fn scheduled_count(&self) -> usize {
        self.state.lock().unwrap().scheduled.len()
    }

    pub fn last_run(&self, key: &str) -> Option<Instant> {
        self.state.lock().unwrap().last_run.get(key).copied()
    }
}
