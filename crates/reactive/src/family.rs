//! Subscription families: the consumer-facing entry point.
//!
//! A family binds one [`Source`] and one [`CacheConfig`] to a pool of
//! per-key subscribers. Consumers attach to a `(key, view)` pair; the
//! family creates the subscriber and notifier on first use.

use std::fmt;
use std::rc::Rc;

use keysync_core::{CacheConfig, CacheEntry, ConsumerId, Key, RawCache, Result, TransformId};
use tracing::trace;

use crate::notifier::Notifier;
use crate::pool::SubscriberPool;
use crate::session::Session;
use crate::source::Source;
use crate::subscriber::Subscriber;
use crate::transform::{Transform, View};

/// Keyed subscriptions sharing one acquisition strategy.
///
/// Cloning a family creates a new handle to the same pool.
pub struct SubscriptionFamily<D: 'static, E: 'static> {
    source: Rc<dyn Source<D, E>>,
    config: CacheConfig,
    pool: SubscriberPool<D, E>,
}

impl<D: 'static, E: 'static> Clone for SubscriptionFamily<D, E> {
    fn clone(&self) -> Self {
        Self {
            source: Rc::clone(&self.source),
            config: self.config.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<D: 'static, E: 'static> fmt::Debug for SubscriptionFamily<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionFamily")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<D: 'static, E: 'static> SubscriptionFamily<D, E> {
    /// Creates a family.
    ///
    /// # Errors
    ///
    /// Returns [`keysync_core::Error::InvalidConfig`] if `config` is invalid.
    pub fn new<S: Source<D, E> + 'static>(source: S, config: CacheConfig) -> Result<Self> {
        Self::from_shared(Rc::new(source), config)
    }

    /// Creates a family from a shared source.
    pub fn from_shared(source: Rc<dyn Source<D, E>>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            config,
            pool: SubscriberPool::new(),
        })
    }

    /// Returns the cache policy.
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the subscriber pool.
    #[inline]
    pub fn pool(&self) -> &SubscriberPool<D, E> {
        &self.pool
    }

    /// Returns the subscriber of `key`, creating it if absent.
    pub fn subscriber(&self, key: impl Into<Key>) -> Subscriber<D, E> {
        let key = key.into();
        self.pool.get_or_insert_with(&key, || {
            Subscriber::new(key.clone(), Rc::clone(&self.source), self.config.clone())
        })
    }

    /// Registers a view on `key` without attaching anyone.
    ///
    /// Idempotent. A fresh notifier is seeded from the raw cache.
    ///
    /// # Errors
    ///
    /// Returns [`keysync_core::Error::TransformMismatch`] if the view's
    /// identity is registered on `key` with another transform type.
    pub fn register_transform<T: Transform<D, E>>(
        &self,
        key: impl Into<Key>,
        view: &View<T>,
    ) -> Result<Rc<Notifier<D, E, T>>> {
        self.subscriber(key)
            .register_notifier(view.id(), view.transform())
    }

    /// Attaches a new consumer to a view and returns its session.
    ///
    /// # Errors
    ///
    /// Returns [`keysync_core::Error::TransformMismatch`] if the view's
    /// identity is registered with another transform type.
    pub fn attach<T, F>(
        &self,
        key: impl Into<Key>,
        view: &View<T>,
        callback: F,
    ) -> Result<Session<D, E, T>>
    where
        T: Transform<D, E>,
        F: Fn(&CacheEntry<T::Data, T::Error>) + 'static,
    {
        let consumer = ConsumerId::next();
        let notifier = self.register_transform(key, view)?;
        notifier.subscribe(consumer, callback)?;
        Ok(Session::new(consumer, notifier))
    }

    /// Attaches a consumer under a caller-chosen identity.
    ///
    /// The caller is responsible for the matching [`detach`](Self::detach).
    ///
    /// # Errors
    ///
    /// Returns [`keysync_core::Error::AlreadyAttached`] if `consumer` is
    /// already attached to this view.
    pub fn attach_as<T, F>(
        &self,
        key: impl Into<Key>,
        view: &View<T>,
        consumer: ConsumerId,
        callback: F,
    ) -> Result<()>
    where
        T: Transform<D, E>,
        F: Fn(&CacheEntry<T::Data, T::Error>) + 'static,
    {
        self.register_transform(key, view)?
            .subscribe(consumer, callback)
    }

    /// Detaches a consumer. Returns false if it was not attached.
    pub fn detach(&self, key: &str, transform: &TransformId, consumer: ConsumerId) -> bool {
        let Some(notifier) = self
            .pool
            .get(key)
            .and_then(|subscriber| subscriber.notifier(transform))
        else {
            trace!(key, transform = %transform, %consumer, "detach of unknown view");
            return false;
        };
        notifier.detach(consumer)
    }

    /// Pushes a local entry through the views of `key`.
    ///
    /// Returns false if `key` has no subscriber.
    pub fn publish(&self, key: &str, entry: CacheEntry<D, E>) -> bool {
        match self.pool.get(key) {
            Some(subscriber) => {
                subscriber.publish(entry);
                true
            }
            None => false,
        }
    }

    /// Returns a snapshot of the raw cache of `key`.
    pub fn raw(&self, key: &str) -> Option<Rc<RawCache<D, E>>> {
        self.pool.get(key).map(|subscriber| subscriber.raw())
    }
}
