//! Keysync Core - shared types for the keysync synchronization engine.
//!
//! This crate provides the value types every other keysync crate is built on:
//!
//! - `Key`: Opaque identifier of one logical data source
//! - `ConsumerId` / `TransformId`: Identities of observers and derived views
//! - `CacheEntry` / `CacheSlot`: The last data/error pair plus its freshness
//! - `CacheConfig` / `RetryConfig` / `ErrorInterval`: Configuration surface
//! - `Error`: Error types reported by the engine
//!
//! # Example
//!
//! ```rust
//! use core::time::Duration;
//! use keysync_core::{CacheConfig, CacheEntry, ErrorInterval, Key};
//!
//! let key = Key::from("prices/BTC");
//! assert_eq!(key.as_str(), "prices/BTC");
//!
//! let entry: CacheEntry<u32, String> = CacheEntry::with_data(42);
//! assert_eq!(entry.data(), Some(&42));
//!
//! let config = CacheConfig::new().with_ttl(Duration::from_millis(100));
//! assert_eq!(config.retention(), Some(Duration::from_millis(100)));
//!
//! let backoff = ErrorInterval::from(vec![Duration::from_secs(1), Duration::from_secs(2)]);
//! assert_eq!(backoff.delay_for(5, Duration::from_secs(10)), Duration::from_secs(2));
//! ```

mod cache;
mod config;
mod error;
mod ids;
mod key;

pub use cache::{CacheEntry, CacheSlot, CompressedCache, RawCache};
pub use config::{CacheConfig, ErrorInterval, RetryConfig};
pub use error::{BoxError, Error, Result};
pub use ids::{ConsumerId, TransformId};
pub use key::Key;
