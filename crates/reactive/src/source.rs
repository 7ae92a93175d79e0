//! Data acquisition strategies.
//!
//! A [`Source`] is the user side of a subscriber: `fetch` is called on the
//! 0 → 1 transition of the active set, `stop` once the last view is gone
//! (immediately, or after the retention window).
//!
//! ```ignore
//! use async_trait::async_trait;
//!
//! struct Ticker;
//!
//! #[async_trait(?Send)]
//! impl Source<u64, String> for Ticker {
//!     async fn fetch(&self, key: Key, deliver: Deliver<u64, String>) -> Result<(), BoxError> {
//!         deliver.data(key.as_str().len() as u64);
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use futures::future::{self, FutureExt, LocalBoxFuture};
use keysync_core::{BoxError, Key};

use crate::subscriber::Deliver;

/// Upstream fetch and stop functions for a key.
///
/// `fetch` runs on a local task. It may deliver any number of times through
/// its [`Deliver`] handle, before or after it returns; deliveries made after
/// the fetch was stopped are ignored. An error returned by either function
/// is logged and otherwise leaves the caches untouched.
#[async_trait(?Send)]
pub trait Source<D: 'static, E: 'static> {
    /// Starts acquiring data for `key`.
    async fn fetch(&self, key: Key, deliver: Deliver<D, E>) -> Result<(), BoxError>;

    /// Releases the upstream resources of `key`.
    async fn stop(&self, key: Key) -> Result<(), BoxError> {
        let _ = key;
        Ok(())
    }
}

type FetchFn<D, E> = Box<dyn Fn(Key, Deliver<D, E>) -> LocalBoxFuture<'static, Result<(), BoxError>>>;
type StopFn = Box<dyn Fn(Key) -> LocalBoxFuture<'static, Result<(), BoxError>>>;

/// A [`Source`] built from a pair of async closures.
pub struct FnSource<D: 'static, E: 'static> {
    fetch: FetchFn<D, E>,
    stop: StopFn,
}

impl<D: 'static, E: 'static> fmt::Debug for FnSource<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSource").finish_non_exhaustive()
    }
}

impl<D: 'static, E: 'static> FnSource<D, E> {
    /// Creates a source from fetch and stop closures.
    pub fn new<F, FFut, S, SFut>(fetch: F, stop: S) -> Self
    where
        F: Fn(Key, Deliver<D, E>) -> FFut + 'static,
        FFut: Future<Output = Result<(), BoxError>> + 'static,
        S: Fn(Key) -> SFut + 'static,
        SFut: Future<Output = Result<(), BoxError>> + 'static,
    {
        Self {
            fetch: Box::new(move |key, deliver| fetch(key, deliver).boxed_local()),
            stop: Box::new(move |key| stop(key).boxed_local()),
        }
    }

    /// Creates a source whose stop is a no-op.
    pub fn fetch_only<F, FFut>(fetch: F) -> Self
    where
        F: Fn(Key, Deliver<D, E>) -> FFut + 'static,
        FFut: Future<Output = Result<(), BoxError>> + 'static,
    {
        Self {
            fetch: Box::new(move |key, deliver| fetch(key, deliver).boxed_local()),
            stop: Box::new(|_| future::ready(Ok(())).boxed_local()),
        }
    }
}

#[async_trait(?Send)]
impl<D: 'static, E: 'static> Source<D, E> for FnSource<D, E> {
    async fn fetch(&self, key: Key, deliver: Deliver<D, E>) -> Result<(), BoxError> {
        (self.fetch)(key, deliver).await
    }

    async fn stop(&self, key: Key) -> Result<(), BoxError> {
        (self.stop)(key).await
    }
}
