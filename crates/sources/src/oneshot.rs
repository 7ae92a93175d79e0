//! Single-shot acquisition.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture};
use keysync_core::{BoxError, Key};
use keysync_reactive::{Deliver, Source};
use tracing::trace;

type Body<D, E> = Box<dyn Fn(Key) -> LocalBoxFuture<'static, Result<D, E>>>;

/// Source fetching once per start and delivering the data or the error.
///
/// A failure of the body is data for the views, not a fetch failure.
pub struct OneShot<D: 'static, E: 'static> {
    body: Body<D, E>,
}

impl<D: 'static, E: 'static> fmt::Debug for OneShot<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShot").finish_non_exhaustive()
    }
}

impl<D: 'static, E: 'static> OneShot<D, E> {
    /// Creates a one-shot source.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(Key) -> Fut + 'static,
        Fut: Future<Output = Result<D, E>> + 'static,
    {
        Self {
            body: Box::new(move |key| body(key).boxed_local()),
        }
    }
}

#[async_trait(?Send)]
impl<D: 'static, E: 'static> Source<D, E> for OneShot<D, E> {
    async fn fetch(&self, key: Key, deliver: Deliver<D, E>) -> Result<(), BoxError> {
        let delivered = match (self.body)(key.clone()).await {
            Ok(data) => deliver.data(data),
            Err(error) => deliver.error(error),
        };
        if !delivered {
            trace!(key = %key, "one-shot result arrived after stop");
        }
        Ok(())
    }
}
