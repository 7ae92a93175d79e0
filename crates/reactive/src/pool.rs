//! Subscriber pool.
//!
//! Maps keys to their subscriber. With idle eviction enabled a subscriber
//! removes itself once its fetch is stopped and its cache cleared; the next
//! attach on that key creates a fresh one.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use hashbrown::HashMap;
use keysync_core::Key;
use tracing::debug;

use crate::subscriber::Subscriber;

type Subscribers<D, E> = RefCell<HashMap<Key, Subscriber<D, E>>>;

/// Key → subscriber map shared by one subscription family.
///
/// Cloning a pool creates a new handle to the same map.
pub struct SubscriberPool<D: 'static, E: 'static> {
    subscribers: Rc<Subscribers<D, E>>,
}

impl<D: 'static, E: 'static> Clone for SubscriberPool<D, E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Rc::clone(&self.subscribers),
        }
    }
}

impl<D: 'static, E: 'static> Default for SubscriberPool<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: 'static, E: 'static> fmt::Debug for SubscriberPool<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberPool")
            .field("len", &self.len())
            .finish()
    }
}

impl<D: 'static, E: 'static> SubscriberPool<D, E> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            subscribers: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Returns the subscriber of `key`, creating it with `make` if absent.
    ///
    /// A created subscriber gets an idle hook that evicts it from this pool.
    pub fn get_or_insert_with<F>(&self, key: &Key, make: F) -> Subscriber<D, E>
    where
        F: FnOnce() -> Subscriber<D, E>,
    {
        if let Some(existing) = self.get(key.as_str()) {
            return existing;
        }

        let subscriber = make();
        let pool = Rc::downgrade(&self.subscribers);
        subscriber.set_idle_hook(Box::new(move |key| evict(&pool, key)));
        self.subscribers
            .borrow_mut()
            .insert(key.clone(), subscriber.clone());
        debug!(key = %key, "subscriber created");
        subscriber
    }

    /// Returns the subscriber of `key`.
    pub fn get(&self, key: &str) -> Option<Subscriber<D, E>> {
        self.subscribers.borrow().get(key).cloned()
    }

    /// Returns true if `key` has a subscriber.
    pub fn contains(&self, key: &str) -> bool {
        self.subscribers.borrow().contains_key(key)
    }

    /// Removes the subscriber of `key` if it is idle.
    ///
    /// Returns true if it was removed.
    pub fn remove_if_idle(&self, key: &str) -> bool {
        let removed = {
            let mut subscribers = self.subscribers.borrow_mut();
            let idle = subscribers.get(key).is_some_and(Subscriber::is_idle);
            if idle {
                subscribers.remove(key)
            } else {
                None
            }
        };
        removed.is_some()
    }

    /// Removes every idle subscriber. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let removed: Vec<Subscriber<D, E>> = {
            let mut subscribers = self.subscribers.borrow_mut();
            let idle: Vec<Key> = subscribers
                .iter()
                .filter(|(_, s)| s.is_idle())
                .map(|(k, _)| k.clone())
                .collect();
            idle.iter()
                .filter_map(|key| subscribers.remove(key))
                .collect()
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "idle subscribers removed");
        }
        removed.len()
    }

    /// Returns the number of subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }

    /// Returns true if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.subscribers.borrow().is_empty()
    }

    /// Returns the keys with a subscriber, in no particular order.
    pub fn keys(&self) -> Vec<Key> {
        self.subscribers.borrow().keys().cloned().collect()
    }

    /// Removes every subscriber, idle or not.
    ///
    /// Running fetches are not stopped. Their later deliveries are dropped
    /// once the removed subscribers are gone.
    pub fn clear(&self) {
        let drained: Vec<_> = self.subscribers.borrow_mut().drain().collect();
        drop(drained);
    }
}

fn evict<D: 'static, E: 'static>(pool: &Weak<Subscribers<D, E>>, key: &Key) {
    let Some(subscribers) = pool.upgrade() else {
        return;
    };
    let removed = {
        let mut map = subscribers.borrow_mut();
        let idle = map.get(key.as_str()).is_some_and(Subscriber::is_idle);
        if idle {
            map.remove(key.as_str())
        } else {
            None
        }
    };
    if removed.is_some() {
        debug!(key = %key, "idle subscriber evicted");
    }
}
