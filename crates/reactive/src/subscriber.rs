//! Subscribers: the single owner of one key's fetch lifecycle.
//!
//! A subscriber holds the raw cache of its key, every notifier ever
//! registered for it and the subset currently holding observers (the active
//! set). The active set's size is the subscriber's reference count:
//!
//! - 0 → 1 starts the fetch (or resumes a fetch still live inside a
//!   retention window),
//! - N → N+1 leaves the fetch alone,
//! - 1 → 0 stops the fetch, immediately or once the retention TTL elapses.
//!
//! Every joining view is rebuilt from the raw cache, since an inactive
//! notifier does not follow the feed.
//!
//! # Scheduling
//!
//! Fetch, stop and every timer run as tasks on the current
//! [`tokio::task::LocalSet`]. All state transitions happen synchronously
//! between suspension points; no borrow is held while user code runs.
//!
//! Outside of a `LocalSet`, or while the thread unwinds, nothing is
//! spawned: the fetch and stop calls are skipped with a warning and the
//! timers fire inline.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::thread;
use std::time::Duration;

use keysync_core::{
    CacheConfig, CacheEntry, CacheSlot, Error, Key, RawCache, Result, TransformId,
};
use tokio::task::{spawn_local, AbortHandle};
use tracing::{debug, trace, warn};

use crate::notifier::{ErasedNotifier, Notifier};
use crate::source::Source;
use crate::transform::Transform;

/// Callback run once a subscriber is idle and its cache has been cleared.
pub(crate) type IdleHook = Box<dyn Fn(&Key)>;

struct Registered<D: 'static, E: 'static> {
    id: TransformId,
    erased: Rc<dyn ErasedNotifier<D, E>>,
    typed: Rc<dyn Any>,
}

struct SubscriberState<D: 'static, E: 'static> {
    cache: CacheSlot<D, E>,
    /// Every notifier ever registered, in registration order.
    notifiers: Vec<Registered<D, E>>,
    /// Notifiers holding at least one observer, in activation order.
    active: Vec<Rc<dyn ErasedNotifier<D, E>>>,
    /// Whether the upstream fetch has been started and not stopped.
    live: bool,
    /// Fetch generation; deliveries tagged with an older epoch are ignored.
    epoch: u64,
    /// Pending release or expiry timer.
    pending: Option<AbortHandle>,
}

pub(crate) struct SubscriberInner<D: 'static, E: 'static> {
    key: Key,
    source: Rc<dyn Source<D, E>>,
    config: CacheConfig,
    state: RefCell<SubscriberState<D, E>>,
    on_idle: RefCell<Option<IdleHook>>,
}

/// Per-key owner of the raw fetch lifecycle and raw cache.
///
/// Cloning a `Subscriber` creates a new handle to the same key state.
pub struct Subscriber<D: 'static, E: 'static> {
    inner: Rc<SubscriberInner<D, E>>,
}

impl<D: 'static, E: 'static> Clone for Subscriber<D, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<D: 'static, E: 'static> fmt::Debug for Subscriber<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Subscriber")
            .field("key", &self.inner.key)
            .field("active", &state.active.len())
            .field("notifiers", &state.notifiers.len())
            .field("live", &state.live)
            .field("epoch", &state.epoch)
            .field("cache_expired", &state.cache.is_expired())
            .finish()
    }
}

impl<D: 'static, E: 'static> Subscriber<D, E> {
    /// Creates a subscriber for `key`.
    pub fn new(key: Key, source: Rc<dyn Source<D, E>>, config: CacheConfig) -> Self {
        Self {
            inner: Rc::new(SubscriberInner {
                key,
                source,
                config,
                state: RefCell::new(SubscriberState {
                    cache: CacheSlot::new(),
                    notifiers: Vec::new(),
                    active: Vec::new(),
                    live: false,
                    epoch: 0,
                    pending: None,
                }),
                on_idle: RefCell::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<SubscriberInner<D, E>>) -> Self {
        Self { inner }
    }

    /// Returns true if both handles refer to the same subscriber.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the key.
    #[inline]
    pub fn key(&self) -> &Key {
        &self.inner.key
    }

    /// Returns the cache policy.
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns a snapshot of the raw cache.
    pub fn raw(&self) -> Rc<RawCache<D, E>> {
        self.inner.state.borrow().cache.entry()
    }

    /// Returns whether the raw cache is marked expired.
    pub fn is_cache_expired(&self) -> bool {
        self.inner.state.borrow().cache.is_expired()
    }

    /// Returns whether the upstream fetch is running.
    pub fn is_live(&self) -> bool {
        self.inner.state.borrow().live
    }

    /// Returns true if nothing is active, the fetch is stopped and no timer
    /// is pending.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.borrow();
        state.active.is_empty() && !state.live && state.pending.is_none()
    }

    /// Returns the current fetch generation.
    pub fn epoch(&self) -> u64 {
        self.inner.state.borrow().epoch
    }

    /// Returns the number of active notifiers.
    pub fn active_count(&self) -> usize {
        self.inner.state.borrow().active.len()
    }

    /// Returns the number of registered notifiers.
    pub fn notifier_count(&self) -> usize {
        self.inner.state.borrow().notifiers.len()
    }

    /// Returns the transforms of the active notifiers, in activation order.
    pub fn active_transforms(&self) -> Vec<TransformId> {
        self.inner
            .state
            .borrow()
            .active
            .iter()
            .map(|n| n.transform_id().clone())
            .collect()
    }

    /// Returns true if the notifier of `transform` is active.
    pub fn is_active(&self, transform: &TransformId) -> bool {
        self.inner
            .state
            .borrow()
            .active
            .iter()
            .any(|n| n.transform_id() == transform)
    }

    pub(crate) fn set_idle_hook(&self, hook: IdleHook) {
        *self.inner.on_idle.borrow_mut() = Some(hook);
    }

    /// Registers the notifier of a transform, or returns the existing one.
    ///
    /// A new notifier replays the current raw cache through its transform
    /// before it accepts observers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransformMismatch`] if `id` is already registered
    /// with a different transform type.
    pub fn register_notifier<T: Transform<D, E>>(
        &self,
        id: &TransformId,
        transform: &Rc<T>,
    ) -> Result<Rc<Notifier<D, E, T>>> {
        if let Some(existing) = self.find_typed(id) {
            return self.downcast(id, existing);
        }

        let raw = self.raw();
        let notifier = Notifier::new(
            self.inner.key.clone(),
            id.clone(),
            Rc::clone(transform),
            Rc::downgrade(&self.inner),
            &raw,
        );

        // The registration replay ran user code, which may have registered
        // the same transform re-entrantly.
        if let Some(existing) = self.find_typed(id) {
            return self.downcast(id, existing);
        }

        self.inner.state.borrow_mut().notifiers.push(Registered {
            id: id.clone(),
            erased: notifier.clone(),
            typed: notifier.clone(),
        });
        debug!(key = %self.inner.key, transform = %id, "notifier registered");

        Ok(notifier)
    }

    fn find_typed(&self, id: &TransformId) -> Option<Rc<dyn Any>> {
        self.inner
            .state
            .borrow()
            .notifiers
            .iter()
            .find(|r| &r.id == id)
            .map(|r| Rc::clone(&r.typed))
    }

    fn downcast<T: Transform<D, E>>(
        &self,
        id: &TransformId,
        notifier: Rc<dyn Any>,
    ) -> Result<Rc<Notifier<D, E, T>>> {
        notifier
            .downcast::<Notifier<D, E, T>>()
            .map_err(|_| Error::TransformMismatch {
                key: self.inner.key.clone(),
                transform: id.clone(),
            })
    }

    pub(crate) fn notifier(&self, id: &TransformId) -> Option<Rc<dyn ErasedNotifier<D, E>>> {
        self.inner
            .state
            .borrow()
            .notifiers
            .iter()
            .find(|r| &r.id == id)
            .map(|r| Rc::clone(&r.erased))
    }

    /// Activates a notifier.
    pub(crate) fn subscribe(&self, notifier: Rc<dyn ErasedNotifier<D, E>>) {
        enum Join {
            Start,
            Resume,
            Replay,
        }

        let join = {
            let mut state = self.inner.state.borrow_mut();
            if state
                .active
                .iter()
                .any(|n| n.transform_id() == notifier.transform_id())
            {
                return;
            }
            state.active.push(Rc::clone(&notifier));

            if state.active.len() > 1 {
                Join::Replay
            } else {
                if let Some(pending) = state.pending.take() {
                    pending.abort();
                }
                state.cache.refresh();
                if state.live {
                    Join::Resume
                } else {
                    Join::Start
                }
            }
        };

        match join {
            Join::Start => self.start_fetch(),
            Join::Resume => debug!(key = %self.inner.key, "re-attached inside retention window"),
            Join::Replay => {}
        }
        self.replay(&*notifier);
    }

    /// Deactivates a notifier. Returns false if it was not active.
    pub(crate) fn unsubscribe(&self, id: &TransformId) -> bool {
        let idle = {
            let mut state = self.inner.state.borrow_mut();
            let before = state.active.len();
            state.active.retain(|n| n.transform_id() != id);
            if state.active.len() == before {
                return false;
            }
            state.active.is_empty()
        };

        if idle {
            match self.inner.config.retention() {
                Some(ttl) => self.schedule_release(ttl),
                None => {
                    self.stop_fetch();
                    self.schedule_expiry(self.inner.config.expiry_delay());
                }
            }
        }
        true
    }

    /// Rebuilds one notifier from the raw cache.
    pub(crate) fn replay(&self, notifier: &dyn ErasedNotifier<D, E>) {
        let raw = self.raw();
        trace!(key = %self.inner.key, transform = %notifier.transform_id(), "replaying raw cache");
        notifier.resync(&raw);
    }

    /// Stores an entry and fans it out without involving the fetch.
    ///
    /// Used for local mutations; the next delivery from the fetch replaces
    /// the entry as usual.
    pub fn publish(&self, entry: CacheEntry<D, E>) {
        let (raw, active) = {
            let mut state = self.inner.state.borrow_mut();
            state.cache.store(entry);
            (state.cache.entry(), state.active.clone())
        };
        self.fan_out(&raw, active);
    }

    /// Stores a delivery of fetch generation `epoch` and fans it out.
    fn notify_observers(&self, epoch: u64, entry: CacheEntry<D, E>) -> bool {
        let (raw, active) = {
            let mut state = self.inner.state.borrow_mut();
            if !state.live || state.epoch != epoch {
                trace!(key = %self.inner.key, epoch, current = state.epoch, "ignoring stale delivery");
                return false;
            }
            state.cache.store(entry);
            (state.cache.entry(), state.active.clone())
        };
        self.fan_out(&raw, active);
        true
    }

    fn fan_out(&self, raw: &RawCache<D, E>, active: Vec<Rc<dyn ErasedNotifier<D, E>>>) {
        for notifier in active {
            // Deactivated by an earlier callback of this fan-out.
            if !self.is_active(notifier.transform_id()) {
                continue;
            }
            notifier.on_raw(raw);
        }
    }

    fn start_fetch(&self) {
        let epoch = {
            let mut state = self.inner.state.borrow_mut();
            state.live = true;
            state.epoch += 1;
            state.epoch
        };
        let deliver = Deliver {
            subscriber: Rc::downgrade(&self.inner),
            epoch,
        };
        let upstream = Rc::clone(&self.inner.source);
        let key = self.inner.key.clone();
        debug!(key = %key, epoch, "starting fetch");

        spawn_on_local_set(&self.inner.key, "fetch", async move {
            if let Err(source) = upstream.fetch(key.clone(), deliver).await {
                let err = Error::FetchFailed { key, source };
                warn!(error = %err, "fetch failed");
            }
        });
    }

    fn stop_fetch(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.live = false;
            state.epoch += 1;
        }
        let upstream = Rc::clone(&self.inner.source);
        let key = self.inner.key.clone();
        debug!(key = %key, "stopping fetch");

        spawn_on_local_set(&self.inner.key, "stop", async move {
            if let Err(source) = upstream.stop(key.clone()).await {
                let err = Error::StopFailed { key, source };
                warn!(error = %err, "stop failed");
            }
        });
    }

    /// Replaces the pending timer.
    fn set_pending(&self, handle: Option<AbortHandle>) {
        let previous = std::mem::replace(&mut self.inner.state.borrow_mut().pending, handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn schedule_release(&self, ttl: Duration) {
        self.inner.state.borrow_mut().cache.expire();
        let weak = Rc::downgrade(&self.inner);
        let handle = spawn_on_local_set(&self.inner.key, "release", async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                Subscriber::from_inner(inner).release();
            }
        });
        let armed = handle.is_some();
        self.set_pending(handle);
        if armed {
            debug!(key = %self.inner.key, ?ttl, "retention window armed");
        } else {
            self.release();
        }
    }

    /// Retention window elapsed: stop the fetch and drop the cache.
    fn release(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.pending = None;
            if !state.active.is_empty() {
                return;
            }
        }
        debug!(key = %self.inner.key, "retention window elapsed");
        self.stop_fetch();
        self.inner.state.borrow_mut().cache.clear();
        self.notify_idle();
    }

    fn schedule_expiry(&self, delay: Duration) {
        self.inner.state.borrow_mut().cache.expire();
        let weak = Rc::downgrade(&self.inner);
        let handle = spawn_on_local_set(&self.inner.key, "expiry", async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Subscriber::from_inner(inner).expire_if_unclaimed();
            }
        });
        let armed = handle.is_some();
        self.set_pending(handle);
        if !armed {
            self.expire_if_unclaimed();
        }
    }

    /// Deferred expiry: clears the cache only if it is still expired and
    /// nobody re-attached in the meantime.
    fn expire_if_unclaimed(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.pending = None;
            if !state.active.is_empty() || !state.cache.is_expired() {
                trace!(key = %self.inner.key, "expiry superseded by a new subscription");
                return;
            }
            state.cache.clear();
        }
        debug!(key = %self.inner.key, "cache expired");
        self.notify_idle();
    }

    fn notify_idle(&self) {
        if !self.inner.config.evict_idle || !self.is_idle() {
            return;
        }
        if let Some(hook) = self.inner.on_idle.borrow().as_ref() {
            hook(&self.inner.key);
        }
    }
}

/// Spawns `future` on the current `LocalSet`.
///
/// Returns `None` after logging if the thread is unwinding or no `LocalSet`
/// is running.
fn spawn_on_local_set<F>(key: &Key, task: &'static str, future: F) -> Option<AbortHandle>
where
    F: Future<Output = ()> + 'static,
{
    if thread::panicking() {
        warn!(key = %key, task, "thread is unwinding, task not spawned");
        return None;
    }
    match panic::catch_unwind(AssertUnwindSafe(|| spawn_local(future))) {
        Ok(handle) => Some(handle.abort_handle()),
        Err(_) => {
            warn!(key = %key, task, "no LocalSet running, task not spawned");
            None
        }
    }
}

/// Delivery handle given to a fetch function.
///
/// A handle is bound to the fetch generation that created it. Once that
/// fetch is stopped, deliveries through the handle are ignored.
pub struct Deliver<D: 'static, E: 'static> {
    subscriber: Weak<SubscriberInner<D, E>>,
    epoch: u64,
}

impl<D: 'static, E: 'static> Clone for Deliver<D, E> {
    fn clone(&self) -> Self {
        Self {
            subscriber: Weak::clone(&self.subscriber),
            epoch: self.epoch,
        }
    }
}

impl<D: 'static, E: 'static> fmt::Debug for Deliver<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deliver")
            .field("epoch", &self.epoch)
            .field("current", &self.is_current())
            .finish()
    }
}

impl<D: 'static, E: 'static> Deliver<D, E> {
    /// Delivers a data/error pair.
    ///
    /// Returns false if the delivery was ignored because the fetch that
    /// received this handle has been stopped.
    pub fn deliver(&self, data: Option<D>, error: Option<E>) -> bool {
        self.entry(CacheEntry::new(data, error))
    }

    /// Delivers data.
    pub fn data(&self, data: D) -> bool {
        self.entry(CacheEntry::with_data(data))
    }

    /// Delivers an error.
    pub fn error(&self, error: E) -> bool {
        self.entry(CacheEntry::with_error(error))
    }

    /// Delivers a cache entry.
    pub fn entry(&self, entry: CacheEntry<D, E>) -> bool {
        match self.subscriber.upgrade() {
            Some(inner) => Subscriber::from_inner(inner).notify_observers(self.epoch, entry),
            None => false,
        }
    }

    /// Returns true while the fetch that received this handle is live.
    pub fn is_current(&self) -> bool {
        self.subscriber.upgrade().is_some_and(|inner| {
            let state = inner.state.borrow();
            state.live && state.epoch == self.epoch
        })
    }

    /// Returns the key, if the subscriber is still alive.
    pub fn key(&self) -> Option<Key> {
        self.subscriber.upgrade().map(|inner| inner.key.clone())
    }
}
