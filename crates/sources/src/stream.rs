//! Streaming acquisition for push-based upstreams.
//!
//! A [`Streaming`] source opens one stream per started key and forwards
//! every item until the stream ends or the key is stopped.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use futures::stream::{LocalBoxStream, Stream, StreamExt};
use hashbrown::HashMap;
use keysync_core::{BoxError, Key};
use keysync_reactive::{Deliver, Source};
use tokio::task::{spawn_local, AbortHandle};
use tracing::debug;

type Open<D, E> = Box<dyn Fn(Key) -> LocalBoxStream<'static, Result<D, E>>>;

/// Source consuming a stream per key.
///
/// `Ok` items are delivered as data, `Err` items as errors; neither ends
/// the stream.
pub struct Streaming<D: 'static, E: 'static> {
    open: Open<D, E>,
    tasks: Rc<RefCell<HashMap<Key, AbortHandle>>>,
}

impl<D: 'static, E: 'static> fmt::Debug for Streaming<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("running", &self.tasks.borrow().len())
            .finish()
    }
}

impl<D: 'static, E: 'static> Streaming<D, E> {
    /// Creates a streaming source from a function opening the stream of a
    /// key.
    pub fn new<F, S>(open: F) -> Self
    where
        F: Fn(Key) -> S + 'static,
        S: Stream<Item = Result<D, E>> + 'static,
    {
        Self {
            open: Box::new(move |key| open(key).boxed_local()),
            tasks: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Returns true while the stream of `key` is being consumed.
    pub fn is_running(&self, key: &str) -> bool {
        self.tasks
            .borrow()
            .get(key)
            .is_some_and(|task| !task.is_finished())
    }
}

#[async_trait(?Send)]
impl<D: 'static, E: 'static> Source<D, E> for Streaming<D, E> {
    async fn fetch(&self, key: Key, deliver: Deliver<D, E>) -> Result<(), BoxError> {
        let mut stream = (self.open)(key.clone());
        let task_key = key.clone();
        let handle = spawn_local(async move {
            while let Some(item) = stream.next().await {
                let delivered = match item {
                    Ok(data) => deliver.data(data),
                    Err(error) => deliver.error(error),
                };
                if !delivered {
                    break;
                }
            }
            debug!(key = %task_key, "stream finished");
        });

        if let Some(previous) = self
            .tasks
            .borrow_mut()
            .insert(key.clone(), handle.abort_handle())
        {
            previous.abort();
        }
        debug!(key = %key, "stream opened");
        Ok(())
    }

    async fn stop(&self, key: Key) -> Result<(), BoxError> {
        let task = self.tasks.borrow_mut().remove(&key);
        if let Some(task) = task {
            task.abort();
            debug!(key = %key, "stream closed");
        }
        Ok(())
    }
}
