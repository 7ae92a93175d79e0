//! Notifiers: derived views over one key's raw feed.
//!
//! A notifier exists per `(Key, TransformId)`. It owns the compressed cache
//! produced by its transform and an observer registry whose size is its
//! reference count: the first observer activates the notifier on its
//! subscriber, the last one deactivates it.
//!
//! # Initialization
//!
//! A notifier is constructed in a not-ready state and, if its transform
//! seeds on registration, immediately runs the transform against the
//! subscriber's current raw cache. Entries emitted during that replay update
//! the compressed cache but are not fanned out, and the replay never counts
//! as a first subscription.
//!
//! A notifier only follows the raw feed while it is active. Whenever an
//! observer joins a notifier that was inactive or expired, the notifier
//! forgets its transform state and rebuilds the compressed cache from the
//! current raw cache.

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use keysync_core::{
    CacheEntry, CacheSlot, CompressedCache, ConsumerId, Error, Key, RawCache, Result,
    TransformId,
};
use tracing::{debug, trace, warn};

use crate::observer::{Observer, ObserverRegistry};
use crate::subscriber::{Subscriber, SubscriberInner};
use crate::transform::{Sink, Transform};

/// Type-erased view of a notifier, as held by its subscriber.
pub(crate) trait ErasedNotifier<D, E> {
    /// Identity of the notifier's transform.
    fn transform_id(&self) -> &TransformId;

    /// Middleware entry point: runs the transform inside a failure boundary
    /// and fans out what it emits.
    fn on_raw(&self, raw: &RawCache<D, E>);

    /// Forgets the transform state and rebuilds the compressed cache from
    /// `raw`. The cache stays expired if nothing is emitted.
    fn resync(&self, raw: &RawCache<D, E>);

    /// Whether the compressed cache is marked expired.
    fn is_expired(&self) -> bool;

    /// Removes a consumer. Returns true if it was attached.
    fn detach(&self, consumer: ConsumerId) -> bool;
}

struct NotifierState<C, CE> {
    cache: CacheSlot<C, CE>,
    observers: ObserverRegistry<C, CE>,
    /// False until the registration replay has completed.
    ready: bool,
    /// Number of fan-outs performed, used to detect whether a subscribe
    /// call already delivered to its new observer.
    deliveries: u64,
}

/// A derived view with its own compressed cache and observers.
pub struct Notifier<D: 'static, E: 'static, T: Transform<D, E>> {
    key: Key,
    transform_id: TransformId,
    transform: Rc<T>,
    subscriber: Weak<SubscriberInner<D, E>>,
    state: RefCell<NotifierState<T::Data, T::Error>>,
    /// Transform state; borrowed only while the transform runs.
    memory: RefCell<T::State>,
}

impl<D: 'static, E: 'static, T: Transform<D, E>> fmt::Debug for Notifier<D, E, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Notifier")
            .field("key", &self.key)
            .field("transform", &self.transform_id)
            .field("observers", &state.observers.len())
            .field("expired", &state.cache.is_expired())
            .field("ready", &state.ready)
            .finish()
    }
}

impl<D: 'static, E: 'static, T: Transform<D, E>> Notifier<D, E, T> {
    /// Constructs a notifier and runs the registration replay against `raw`.
    pub(crate) fn new(
        key: Key,
        transform_id: TransformId,
        transform: Rc<T>,
        subscriber: Weak<SubscriberInner<D, E>>,
        raw: &RawCache<D, E>,
    ) -> Rc<Self> {
        let notifier = Rc::new(Self {
            key,
            transform_id,
            transform,
            subscriber,
            state: RefCell::new(NotifierState {
                cache: CacheSlot::new(),
                observers: ObserverRegistry::new(),
                ready: false,
                deliveries: 0,
            }),
            memory: RefCell::new(T::State::default()),
        });

        if notifier.transform.seeds_on_register() && !raw.is_empty() {
            notifier.on_raw(raw);
        }
        notifier.state.borrow_mut().ready = true;

        notifier
    }

    /// Returns the key of the owning subscriber.
    #[inline]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Returns the transform identity.
    #[inline]
    pub fn transform_id(&self) -> &TransformId {
        &self.transform_id
    }

    /// Returns the transform.
    #[inline]
    pub fn transform(&self) -> &Rc<T> {
        &self.transform
    }

    /// Returns the compressed cache entry, empty or not.
    pub fn cache(&self) -> Rc<CompressedCache<T::Data, T::Error>> {
        self.state.borrow().cache.entry()
    }

    /// Returns the compressed cache entry if it holds a value.
    pub fn current(&self) -> Option<Rc<CompressedCache<T::Data, T::Error>>> {
        let state = self.state.borrow();
        state.cache.has_value().then(|| state.cache.entry())
    }

    /// Returns whether the compressed cache is marked expired.
    pub fn is_expired(&self) -> bool {
        self.state.borrow().cache.is_expired()
    }

    /// Returns whether the registration replay has completed.
    pub fn is_ready(&self) -> bool {
        self.state.borrow().ready
    }

    /// Returns the number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.state.borrow().observers.len()
    }

    /// Returns true if the consumer is attached.
    pub fn is_observing(&self, consumer: ConsumerId) -> bool {
        self.state.borrow().observers.contains(consumer)
    }

    /// Returns the owning subscriber, if it is still alive.
    pub fn subscriber(&self) -> Option<Subscriber<D, E>> {
        self.subscriber.upgrade().map(Subscriber::from_inner)
    }

    /// Attaches a consumer.
    ///
    /// The first observer activates this notifier on its subscriber, which
    /// starts the fetch and replays the raw cache. A later observer joining
    /// an expired notifier triggers a replay. If nothing was delivered to
    /// the new observer during this call, it receives the current fresh
    /// compressed value, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriberGone`] if the owning subscriber was
    /// evicted, and [`Error::AlreadyAttached`] if `consumer` is attached.
    pub fn subscribe<F>(self: &Rc<Self>, consumer: ConsumerId, callback: F) -> Result<()>
    where
        F: Fn(&CacheEntry<T::Data, T::Error>) + 'static,
    {
        let Some(subscriber) = self.subscriber() else {
            return Err(Error::SubscriberGone {
                key: self.key.clone(),
                transform: self.transform_id.clone(),
            });
        };

        let (first, expired, deliveries) = {
            let mut state = self.state.borrow_mut();
            if !state.observers.insert(Observer::new(consumer, callback)) {
                return Err(Error::AlreadyAttached {
                    key: self.key.clone(),
                    transform: self.transform_id.clone(),
                    consumer,
                });
            }
            (
                state.observers.len() == 1,
                state.cache.is_expired(),
                state.deliveries,
            )
        };
        debug!(key = %self.key, transform = %self.transform_id, %consumer, "observer attached");

        if first {
            subscriber.subscribe(Rc::clone(self) as Rc<dyn ErasedNotifier<D, E>>);
        } else if expired {
            subscriber.replay(&**self);
        }

        let initial = {
            let state = self.state.borrow();
            if state.deliveries == deliveries
                && state.cache.has_value()
                && !state.cache.is_expired()
            {
                state
                    .observers
                    .get(consumer)
                    .cloned()
                    .map(|observer| (observer, state.cache.entry()))
            } else {
                None
            }
        };
        if let Some((observer, entry)) = initial {
            self.deliver_to(&observer, &entry);
        }

        Ok(())
    }

    /// Detaches a consumer and marks the compressed cache expired.
    ///
    /// The last observer deactivates this notifier on its subscriber.
    /// Returns false if the consumer was not attached.
    pub fn unsubscribe(&self, consumer: ConsumerId) -> bool {
        let last = {
            let mut state = self.state.borrow_mut();
            if !state.observers.remove(consumer) {
                return false;
            }
            state.cache.expire();
            state.observers.is_empty()
        };
        debug!(key = %self.key, transform = %self.transform_id, %consumer, "observer detached");

        if last {
            if let Some(subscriber) = self.subscriber() {
                subscriber.unsubscribe(&self.transform_id);
            }
        }
        true
    }

    /// Stores a compressed entry and fans it out to every observer.
    ///
    /// Fan-out is suppressed until the registration replay has completed.
    /// An observer detached by an earlier callback of the same fan-out is
    /// skipped.
    pub fn notify_observers(&self, entry: CacheEntry<T::Data, T::Error>) {
        let (entry, observers) = {
            let mut state = self.state.borrow_mut();
            state.cache.store(entry);
            if !state.ready {
                return;
            }
            state.deliveries += 1;
            (state.cache.entry(), state.observers.snapshot())
        };

        for observer in observers {
            if !self.is_observing(observer.consumer()) {
                trace!(key = %self.key, consumer = %observer.consumer(), "skipping detached observer");
                continue;
            }
            self.deliver_to(&observer, &entry);
        }
    }

    fn deliver_to(
        &self,
        observer: &Observer<T::Data, T::Error>,
        entry: &CacheEntry<T::Data, T::Error>,
    ) {
        if panic::catch_unwind(AssertUnwindSafe(|| observer.notify(entry))).is_err() {
            let err = Error::ObserverPanicked {
                key: self.key.clone(),
                transform: self.transform_id.clone(),
                consumer: observer.consumer(),
            };
            warn!(error = %err, "observer callback panicked");
        }
    }
}

impl<D: 'static, E: 'static, T: Transform<D, E>> ErasedNotifier<D, E> for Notifier<D, E, T> {
    fn transform_id(&self) -> &TransformId {
        &self.transform_id
    }

    fn on_raw(&self, raw: &RawCache<D, E>) {
        let mut sink = Sink::new();
        let applied = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut memory = self.memory.borrow_mut();
            self.transform.apply(&mut memory, raw, &mut sink)
        }));
        match applied {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                let err = Error::TransformFailed {
                    key: self.key.clone(),
                    transform: self.transform_id.clone(),
                    source,
                };
                warn!(error = %err, "transform failed");
            }
            Err(_) => {
                let err = Error::TransformPanicked {
                    key: self.key.clone(),
                    transform: self.transform_id.clone(),
                };
                warn!(error = %err, "transform panicked");
            }
        }

        for entry in sink.into_entries() {
            self.notify_observers(entry);
        }
    }

    fn resync(&self, raw: &RawCache<D, E>) {
        self.state.borrow_mut().cache.expire();
        match self.memory.try_borrow_mut() {
            Ok(mut memory) => *memory = T::State::default(),
            Err(_) => debug!(key = %self.key, transform = %self.transform_id, "transform running, state kept"),
        }
        if !raw.is_empty() {
            self.on_raw(raw);
        }
    }

    fn is_expired(&self) -> bool {
        Notifier::is_expired(self)
    }

    fn detach(&self, consumer: ConsumerId) -> bool {
        self.unsubscribe(consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FnSource, Source};
    use crate::subscriber::Deliver;
    use crate::transform::{Distinct, FromFn, Identity, Map};
    use keysync_core::{BoxError, CacheConfig};
    use std::cell::Cell;
    use std::future::Future;
    use tokio::task::LocalSet;

    fn idle_source() -> Rc<dyn Source<i32, String>> {
        Rc::new(FnSource::fetch_only(|_key, _deliver: Deliver<i32, String>| async {
            Ok(())
        }))
    }

    /// Registers `transform` on a subscriber whose raw cache holds `raw`.
    fn registered<T: Transform<i32, String>>(
        transform: T,
        raw: RawCache<i32, String>,
    ) -> (Subscriber<i32, String>, Rc<Notifier<i32, String, T>>) {
        let subscriber = Subscriber::new(Key::from("k"), idle_source(), CacheConfig::new());
        subscriber.publish(raw);
        let notifier = subscriber
            .register_notifier(&TransformId::from_static("t"), &Rc::new(transform))
            .unwrap();
        (subscriber, notifier)
    }

    async fn local(test: impl Future<Output = ()>) {
        LocalSet::new().run_until(test).await;
    }

    fn recorder<C: Clone + 'static, CE: 'static>(
    ) -> (Rc<RefCell<Vec<Option<C>>>>, impl Fn(&CacheEntry<C, CE>)) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        (seen, move |entry: &CacheEntry<C, CE>| {
            seen_clone.borrow_mut().push(entry.data.clone())
        })
    }

    #[test]
    fn test_registration_replay_seeds_silently() {
        let (_subscriber, notifier) = registered(Identity, CacheEntry::with_data(10));

        assert!(notifier.is_ready());
        assert_eq!(notifier.current().and_then(|c| c.data), Some(10));
        assert!(!notifier.is_expired());
    }

    #[test]
    fn test_no_seed_on_empty_raw() {
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let transform = FromFn::new(move |_: &RawCache<i32, String>, _: &mut Sink<i32, String>| {
            calls_clone.set(calls_clone.get() + 1);
            Ok(())
        });

        let (_subscriber, notifier) = registered(transform, CacheEntry::empty());
        assert_eq!(calls.get(), 0);
        assert!(notifier.current().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_initial_sync_on_subscribe() {
        local(async {
            let (_subscriber, notifier) = registered(Identity, CacheEntry::with_data(7));
            let (first, first_callback) = recorder::<i32, String>();
            let (second, second_callback) = recorder::<i32, String>();

            notifier.subscribe(ConsumerId::from_raw(1), first_callback).unwrap();
            notifier.subscribe(ConsumerId::from_raw(2), second_callback).unwrap();

            assert_eq!(*first.borrow(), vec![Some(7)]);
            assert_eq!(*second.borrow(), vec![Some(7)]);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_duplicate_consumer_rejected() {
        local(async {
            let (_subscriber, notifier) = registered(Identity, CacheEntry::empty());
            let consumer = ConsumerId::from_raw(1);

            notifier.subscribe(consumer, |_| {}).unwrap();
            let err = notifier.subscribe(consumer, |_| {}).unwrap_err();

            assert!(matches!(err, Error::AlreadyAttached { .. }));
            assert_eq!(notifier.observer_count(), 1);
        })
        .await;
    }

    #[test]
    fn test_subscribe_after_subscriber_dropped() {
        let (subscriber, notifier) = registered(Identity, CacheEntry::with_data(1));
        drop(subscriber);

        let err = notifier.subscribe(ConsumerId::from_raw(1), |_| {}).unwrap_err();

        assert!(matches!(err, Error::SubscriberGone { .. }));
        assert_eq!(notifier.observer_count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_fan_out_in_insertion_order() {
        local(async {
            let (_subscriber, notifier) = registered(Identity, CacheEntry::empty());
            let order = Rc::new(RefCell::new(Vec::new()));

            for n in [2, 1, 3] {
                let order = order.clone();
                notifier
                    .subscribe(ConsumerId::from_raw(n), move |_| order.borrow_mut().push(n))
                    .unwrap();
            }
            notifier.notify_observers(CacheEntry::with_data(1));

            assert_eq!(*order.borrow(), vec![2, 1, 3]);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_unsubscribe_expires_cache() {
        local(async {
            let (_subscriber, notifier) = registered(Identity, CacheEntry::with_data(1));
            let consumer = ConsumerId::from_raw(1);
            notifier.subscribe(consumer, |_| {}).unwrap();

            assert!(notifier.unsubscribe(consumer));
            assert!(notifier.is_expired());
            assert!(!notifier.unsubscribe(consumer));
        })
        .await;
    }

    #[test]
    fn test_resync_forgets_transform_state() {
        let parity = Distinct::new(|raw: &RawCache<i32, String>| {
            CacheEntry::<bool, String>::new(raw.data.map(|d| d % 2 == 0), None)
        });
        let (_subscriber, notifier) = registered(parity, CacheEntry::with_data(2));

        notifier.state.borrow_mut().cache.expire();
        notifier.on_raw(&CacheEntry::with_data(4));
        assert!(notifier.is_expired());

        notifier.resync(&CacheEntry::with_data(4));

        assert!(!notifier.is_expired());
        assert_eq!(notifier.current().and_then(|c| c.data), Some(true));
    }

    #[test]
    fn test_resync_on_empty_raw_expires() {
        let (_subscriber, notifier) = registered(Identity, CacheEntry::with_data(3));

        notifier.resync(&CacheEntry::empty());

        assert!(notifier.is_expired());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_failing_transform_is_isolated() {
        local(async {
            let transform =
                FromFn::new(|raw: &RawCache<i32, String>, sink: &mut Sink<i32, String>| {
                    sink.notify(raw.data, None);
                    Err::<(), BoxError>("second half failed".into())
                });
            let (_subscriber, notifier) = registered(transform, CacheEntry::empty());
            let (seen, callback) = recorder::<i32, String>();
            notifier.subscribe(ConsumerId::from_raw(1), callback).unwrap();

            notifier.on_raw(&CacheEntry::with_data(4));

            assert_eq!(*seen.borrow(), vec![Some(4)]);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_panicking_transform_is_isolated() {
        local(async {
            let transform = Map::new(|raw: &RawCache<i32, String>| -> CacheEntry<i32, String> {
                if raw.data == Some(13) {
                    panic!("unlucky");
                }
                CacheEntry::new(raw.data, None)
            });
            let (_subscriber, notifier) = registered(transform, CacheEntry::empty());
            let (seen, callback) = recorder::<i32, String>();
            notifier.subscribe(ConsumerId::from_raw(1), callback).unwrap();

            notifier.on_raw(&CacheEntry::with_data(13));
            notifier.on_raw(&CacheEntry::with_data(14));

            assert_eq!(*seen.borrow(), vec![Some(14)]);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_panicking_observer_does_not_block_siblings() {
        local(async {
            let (_subscriber, notifier) = registered(Identity, CacheEntry::empty());
            notifier
                .subscribe(ConsumerId::from_raw(1), |_| panic!("bad observer"))
                .unwrap();
            let (seen, callback) = recorder::<i32, String>();
            notifier.subscribe(ConsumerId::from_raw(2), callback).unwrap();

            notifier.notify_observers(CacheEntry::with_data(5));

            assert_eq!(*seen.borrow(), vec![Some(5)]);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_observer_detached_mid_fan_out_is_skipped() {
        local(async {
            let (_subscriber, notifier) = registered(Identity, CacheEntry::empty());
            let second = ConsumerId::from_raw(2);

            let weak = Rc::downgrade(&notifier);
            notifier
                .subscribe(ConsumerId::from_raw(1), move |_| {
                    if let Some(notifier) = weak.upgrade() {
                        notifier.unsubscribe(second);
                    }
                })
                .unwrap();
            let (seen, callback) = recorder::<i32, String>();
            notifier.subscribe(second, callback).unwrap();

            notifier.notify_observers(CacheEntry::with_data(9));

            assert!(seen.borrow().is_empty());
            assert_eq!(notifier.observer_count(), 1);
        })
        .await;
    }
}
