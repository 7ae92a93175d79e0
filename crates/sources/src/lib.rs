//! Keysync Sources - acquisition strategies for keysync subscriptions.
//!
//! Every strategy implements [`keysync_reactive::Source`] and plugs into a
//! [`keysync_reactive::SubscriptionFamily`]:
//!
//! - `Periodic`: Fetch on an interval, back off after failures
//! - `OneShot`: Fetch once per start
//! - `Streaming`: Forward a push-based stream until stopped
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use keysync_core::{CacheConfig, RetryConfig};
//! use keysync_reactive::{Identity, SubscriptionFamily, View};
//! use keysync_sources::{Periodic, PeriodicOptions};
//!
//! let retry = RetryConfig::new(Duration::from_secs(10))
//!     .with_error_interval(vec![Duration::from_secs(1), Duration::from_secs(5)])
//!     .with_maximum_retry_count(5);
//! let prices = Periodic::with_options(
//!     PeriodicOptions::new(retry).with_terminal_error("gave up".to_string()),
//!     |key| async move { fetch_price(key.as_str()).await },
//! )?;
//!
//! let family = SubscriptionFamily::new(prices, CacheConfig::new())?;
//! let session = family.attach("BTC", &View::new("raw", Identity), |entry| {
//!     println!("{:?}", entry.data);
//! })?;
//! ```

pub mod oneshot;
pub mod periodic;
pub mod stream;

pub use oneshot::OneShot;
pub use periodic::{Periodic, PeriodicOptions, Phase};
pub use stream::Streaming;
