//! Observer registry.
//!
//! Every notifier owns one registry mapping consumer identities to delivery
//! callbacks. The size of the registry is the notifier's reference count.

use std::rc::Rc;
use keysync_core::{CacheEntry, ConsumerId};

/// Callback type for compressed cache deliveries.
pub type ObserverCallback<C, CE> = Rc<dyn Fn(&CacheEntry<C, CE>)>;

/// One consumer's registered delivery callback.
pub struct Observer<C, CE> {
    /// Identity of the consumer
    consumer: ConsumerId,
    /// Callback to invoke on deliveries
    callback: ObserverCallback<C, CE>,
}

impl<C, CE> Clone for Observer<C, CE> {
    fn clone(&self) -> Self {
        Self {
            consumer: self.consumer,
            callback: Rc::clone(&self.callback),
        }
    }
}

impl<C, CE> Observer<C, CE> {
    /// Creates a new observer entry.
    pub fn new<F>(consumer: ConsumerId, callback: F) -> Self
    where
        F: Fn(&CacheEntry<C, CE>) + 'static,
    {
        Self {
            consumer,
            callback: Rc::new(callback),
        }
    }

    /// Returns the consumer identity.
    #[inline]
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Invokes the callback.
    #[inline]
    pub fn notify(&self, entry: &CacheEntry<C, CE>) {
        (self.callback)(entry);
    }
}

/// Ordered mapping from consumer identity to callback.
///
/// Observers are kept in insertion order, which is the order deliveries
/// are fanned out in.
pub struct ObserverRegistry<C, CE> {
    observers: Vec<Observer<C, CE>>,
}

impl<C, CE> Default for ObserverRegistry<C, CE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, CE> ObserverRegistry<C, CE> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Registers an observer.
    ///
    /// Returns false and leaves the registry untouched if the consumer is
    /// already registered.
    pub fn insert(&mut self, observer: Observer<C, CE>) -> bool {
        if self.contains(observer.consumer) {
            return false;
        }
        self.observers.push(observer);
        true
    }

    /// Removes a consumer.
    ///
    /// Returns true if the consumer was found and removed.
    pub fn remove(&mut self, consumer: ConsumerId) -> bool {
        let len_before = self.observers.len();
        self.observers.retain(|o| o.consumer != consumer);
        self.observers.len() < len_before
    }

    /// Returns true if the consumer is registered.
    #[inline]
    pub fn contains(&self, consumer: ConsumerId) -> bool {
        self.observers.iter().any(|o| o.consumer == consumer)
    }

    /// Returns the observer of a consumer.
    pub fn get(&self, consumer: ConsumerId) -> Option<&Observer<C, CE>> {
        self.observers.iter().find(|o| o.consumer == consumer)
    }

    /// Returns a copy of the registered observers, in insertion order.
    ///
    /// Fan-out iterates over a snapshot so callbacks may attach or detach
    /// consumers while a delivery is in progress.
    pub fn snapshot(&self) -> Vec<Observer<C, CE>> {
        self.observers.clone()
    }

    /// Returns the registered consumers, in insertion order.
    pub fn consumers(&self) -> Vec<ConsumerId> {
        self.observers.iter().map(|o| o.consumer).collect()
    }

    /// Returns the number of observers.
    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Returns true if there are no observers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
