//! Keysync Reactive - reference-counted data subscriptions.
//!
//! This crate guarantees exactly one running data acquisition per key, no
//! matter how many consumers are interested in it. Consumers attach to a
//! view of a key and receive callbacks; acquisition starts with the first
//! consumer and stops after the last one is gone.
//!
//! # Core Concepts
//!
//! - `Subscriber`: Owns one key's raw cache and fetch lifecycle
//! - `Notifier`: A derived view of a key with its own compressed cache
//! - `Transform`: Middleware turning raw updates into compressed ones
//! - `SubscriberPool`: Key → subscriber map, evicting idle entries
//! - `SubscriptionFamily`: Entry point binding a `Source` to a pool
//! - `Session`: Scoped attachment; dropping it detaches
//!
//! # Example
//!
//! ```ignore
//! use keysync_core::{CacheConfig, CacheEntry, RawCache};
//! use keysync_reactive::{FnSource, Identity, Map, SubscriptionFamily, View};
//!
//! let family = SubscriptionFamily::new(
//!     FnSource::fetch_only(|key, deliver| async move {
//!         deliver.data(key.as_str().len());
//!         Ok(())
//!     }),
//!     CacheConfig::new(),
//! )?;
//!
//! let raw = View::new("raw", Identity);
//! let even = View::new(
//!     "even",
//!     Map::new(|raw: &RawCache<usize, String>| {
//!         CacheEntry::<bool, ()>::new(raw.data.map(|n| n % 2 == 0), None)
//!     }),
//! );
//!
//! // Both sessions share a single fetch of "prices".
//! let a = family.attach("prices", &raw, |entry| println!("raw: {:?}", entry.data))?;
//! let b = family.attach("prices", &even, |entry| println!("even: {:?}", entry.data))?;
//!
//! drop(a);
//! drop(b); // last consumer gone: the fetch is stopped
//! ```
//!
//! All operations must run inside a [`tokio::task::LocalSet`].

pub mod family;
pub mod notifier;
pub mod observer;
pub mod pool;
pub mod session;
pub mod source;
pub mod subscriber;
pub mod transform;

pub use family::SubscriptionFamily;
pub use notifier::Notifier;
pub use observer::{Observer, ObserverCallback, ObserverRegistry};
pub use pool::SubscriberPool;
pub use session::Session;
pub use source::{FnSource, Source};
pub use subscriber::{Deliver, Subscriber};
pub use transform::{Distinct, FromFn, Identity, Map, Sink, Transform, View};

// Re-export commonly used types from keysync-core
pub use keysync_core::{
    BoxError, CacheConfig, CacheEntry, CompressedCache, ConsumerId, Error, Key, RawCache,
    Result, TransformId,
};
