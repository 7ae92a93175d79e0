//! Periodic acquisition with error backoff.
//!
//! [`Periodic`] wraps a one-shot fetch body in a self-rescheduling timer:
//!
//! ```text
//! Idle → Fetching → (ok) → Scheduled(interval) → Fetching → ...
//!                 → (err) → Scheduled(error delay) | Terminal | Idle
//! ```
//!
//! The retry counter of a key survives stop/start cycles for the lifetime
//! of the wrapper; only a successful fetch resets it.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture};
use hashbrown::HashMap;
use keysync_core::{BoxError, Key, Result, RetryConfig};
use keysync_reactive::{Deliver, Source};
use tokio::task::{spawn_local, AbortHandle};
use tracing::{debug, info, trace, warn};

type Body<D> = Box<dyn Fn(Key) -> LocalBoxFuture<'static, std::result::Result<D, BoxError>>>;

/// Options of a [`Periodic`] source.
#[derive(Clone, Debug)]
pub struct PeriodicOptions<E> {
    /// Interval and backoff policy.
    pub retry: RetryConfig,
    /// Error delivered once when the retry cap is reached.
    pub terminal_error: Option<E>,
}

impl<E> PeriodicOptions<E> {
    /// Creates options without a terminal error.
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            terminal_error: None,
        }
    }

    /// Sets the error delivered when the retry cap is reached.
    pub fn with_terminal_error(mut self, error: E) -> Self {
        self.terminal_error = Some(error);
        self
    }
}

/// Scheduling phase of one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Not fetching: never started, stopped, or retrying disabled after a
    /// failure.
    Idle,
    /// Waiting for the next attempt.
    Scheduled,
    /// An attempt is running.
    Fetching,
    /// The retry cap was reached; nothing is scheduled.
    Terminal,
}

/// What to do after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Reschedule(Duration),
    Terminal,
    Halt,
}

fn on_failure(retry: &RetryConfig, retry_count: &mut u32) -> Step {
    if !retry.should_retry_on_error {
        return Step::Halt;
    }
    *retry_count = retry_count.saturating_add(1);
    if retry.is_exhausted(*retry_count) {
        Step::Terminal
    } else {
        Step::Reschedule(retry.error_delay(*retry_count))
    }
}

struct KeyState<D: 'static, E: 'static> {
    retry_count: u32,
    /// Bumped on every start and stop; attempts of an older generation are
    /// ignored.
    generation: u64,
    timer: Option<AbortHandle>,
    deliver: Option<Deliver<D, E>>,
    phase: Phase,
    last_delay: Option<Duration>,
}

impl<D: 'static, E: 'static> KeyState<D, E> {
    fn new() -> Self {
        Self {
            retry_count: 0,
            generation: 0,
            timer: None,
            deliver: None,
            phase: Phase::Idle,
            last_delay: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

enum Outcome<D: 'static, E: 'static> {
    Delivered(Option<Deliver<D, E>>, D),
    Reschedule(Duration),
    Terminal(Option<Deliver<D, E>>),
    Halt,
}

struct PeriodicInner<D: 'static, E: 'static> {
    body: Body<D>,
    options: PeriodicOptions<E>,
    keys: RefCell<HashMap<Key, KeyState<D, E>>>,
}

/// Source fetching on a fixed interval and backing off after failures.
///
/// Cloning creates a new handle to the same per-key state.
pub struct Periodic<D: 'static, E: 'static> {
    inner: Rc<PeriodicInner<D, E>>,
}

impl<D: 'static, E: 'static> Clone for Periodic<D, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<D: 'static, E: fmt::Debug + 'static> fmt::Debug for Periodic<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Periodic")
            .field("options", &self.inner.options)
            .field("keys", &self.inner.keys.borrow().len())
            .finish()
    }
}

impl<D: 'static, E: Clone + 'static> Periodic<D, E> {
    /// Creates a periodic source without a terminal error.
    ///
    /// # Errors
    ///
    /// Returns [`keysync_core::Error::InvalidConfig`] if `retry` is invalid.
    pub fn new<F, Fut>(retry: RetryConfig, body: F) -> Result<Self>
    where
        F: Fn(Key) -> Fut + 'static,
        Fut: Future<Output = std::result::Result<D, BoxError>> + 'static,
    {
        Self::with_options(PeriodicOptions::new(retry), body)
    }

    /// Creates a periodic source.
    pub fn with_options<F, Fut>(options: PeriodicOptions<E>, body: F) -> Result<Self>
    where
        F: Fn(Key) -> Fut + 'static,
        Fut: Future<Output = std::result::Result<D, BoxError>> + 'static,
    {
        options.retry.validate()?;
        Ok(Self {
            inner: Rc::new(PeriodicInner {
                body: Box::new(move |key| body(key).boxed_local()),
                options,
                keys: RefCell::new(HashMap::new()),
            }),
        })
    }

    /// Returns the options.
    pub fn options(&self) -> &PeriodicOptions<E> {
        &self.inner.options
    }

    /// Returns the consecutive failure count of `key`.
    pub fn retry_count(&self, key: &str) -> u32 {
        self.inner
            .keys
            .borrow()
            .get(key)
            .map_or(0, |state| state.retry_count)
    }

    /// Returns the scheduling phase of `key`.
    pub fn phase(&self, key: &str) -> Phase {
        self.inner
            .keys
            .borrow()
            .get(key)
            .map_or(Phase::Idle, |state| state.phase)
    }

    /// Returns the delay of the most recently scheduled attempt of `key`.
    pub fn last_delay(&self, key: &str) -> Option<Duration> {
        self.inner
            .keys
            .borrow()
            .get(key)
            .and_then(|state| state.last_delay)
    }
}

impl<D: 'static, E: Clone + 'static> PeriodicInner<D, E> {
    /// Starts a new generation for `key`, cancelling whatever was pending.
    fn begin(&self, key: &Key, deliver: Deliver<D, E>) -> u64 {
        let mut keys = self.keys.borrow_mut();
        let state = keys.entry(key.clone()).or_insert_with(KeyState::new);
        state.cancel_timer();
        state.generation += 1;
        state.deliver = Some(deliver);
        state.phase = Phase::Idle;
        state.generation
    }

    fn end(&self, key: &Key) {
        let mut keys = self.keys.borrow_mut();
        if let Some(state) = keys.get_mut(key) {
            state.cancel_timer();
            state.generation += 1;
            state.deliver = None;
            state.phase = Phase::Idle;
        }
    }

    /// Marks `key` as fetching. Returns false if `generation` is stale.
    fn enter(&self, key: &Key, generation: u64) -> bool {
        let mut keys = self.keys.borrow_mut();
        match keys.get_mut(key) {
            Some(state) if state.generation == generation => {
                state.phase = Phase::Fetching;
                true
            }
            _ => false,
        }
    }

    fn attempt(self: &Rc<Self>, key: Key, generation: u64) -> LocalBoxFuture<'static, ()> {
        let inner = Rc::clone(self);
        async move {
            if !inner.enter(&key, generation) {
                return;
            }
            let result = (inner.body)(key.clone()).await;
            inner.complete(key, generation, result);
        }
        .boxed_local()
    }

    fn complete(
        self: &Rc<Self>,
        key: Key,
        generation: u64,
        result: std::result::Result<D, BoxError>,
    ) {
        let retry = &self.options.retry;
        let outcome = {
            let mut keys = self.keys.borrow_mut();
            let Some(state) = keys.get_mut(&key).filter(|s| s.generation == generation) else {
                trace!(key = %key, generation, "ignoring attempt of a stopped fetch");
                return;
            };
            match result {
                Ok(data) => {
                    state.retry_count = 0;
                    Outcome::Delivered(state.deliver.clone(), data)
                }
                Err(err) => {
                    warn!(key = %key, retry_count = state.retry_count + 1, error = %err, "periodic fetch failed");
                    match on_failure(retry, &mut state.retry_count) {
                        Step::Reschedule(delay) => Outcome::Reschedule(delay),
                        Step::Terminal => {
                            state.phase = Phase::Terminal;
                            Outcome::Terminal(state.deliver.clone())
                        }
                        Step::Halt => {
                            state.phase = Phase::Idle;
                            Outcome::Halt
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Delivered(deliver, data) => {
                if let Some(deliver) = deliver {
                    deliver.data(data);
                }
                self.schedule(key, generation, retry.interval);
            }
            Outcome::Reschedule(delay) => self.schedule(key, generation, delay),
            Outcome::Terminal(deliver) => {
                info!(key = %key, max = ?retry.maximum_retry_count, "retry limit reached, giving up");
                if let (Some(deliver), Some(error)) = (deliver, self.options.terminal_error.clone()) {
                    deliver.deliver(None, Some(error));
                }
            }
            Outcome::Halt => debug!(key = %key, "retry disabled, not rescheduling"),
        }
    }

    fn schedule(self: &Rc<Self>, key: Key, generation: u64, delay: Duration) {
        let inner = Rc::clone(self);
        let task_key = key.clone();
        let handle = spawn_local(async move {
            tokio::time::sleep(delay).await;
            {
                // Once the attempt runs, stop must not abort it.
                let mut keys = inner.keys.borrow_mut();
                if let Some(state) = keys.get_mut(&task_key) {
                    if state.generation == generation {
                        state.timer = None;
                    }
                }
            }
            inner.attempt(task_key, generation).await;
        });

        let mut keys = self.keys.borrow_mut();
        match keys.get_mut(&key) {
            Some(state) if state.generation == generation => {
                state.cancel_timer();
                state.timer = Some(handle.abort_handle());
                state.phase = Phase::Scheduled;
                state.last_delay = Some(delay);
                debug!(
                    key = %key,
                    ?delay,
                    retry_count = state.retry_count,
                    "next fetch scheduled"
                );
            }
            _ => handle.abort(),
        }
    }
}

#[async_trait(?Send)]
impl<D: 'static, E: Clone + 'static> Source<D, E> for Periodic<D, E> {
    async fn fetch(&self, key: Key, deliver: Deliver<D, E>) -> std::result::Result<(), BoxError> {
        let generation = self.inner.begin(&key, deliver);
        debug!(key = %key, generation, "periodic fetch started");
        self.inner.attempt(key, generation).await;
        Ok(())
    }

    async fn stop(&self, key: Key) -> std::result::Result<(), BoxError> {
        self.inner.end(&key);
        debug!(key = %key, "periodic fetch stopped");
        Ok(())
    }
}
