//! Scoped attachment handles.

use std::fmt;
use std::rc::Rc;

use keysync_core::{CompressedCache, ConsumerId, Key, TransformId};

use crate::notifier::Notifier;
use crate::transform::Transform;

/// An attached consumer of one view.
///
/// The consumer stays attached until the session is closed or dropped.
/// Dropping the last session of a key may stop its fetch. The stop runs on
/// the current [`tokio::task::LocalSet`]; outside of one, or while the
/// thread unwinds, it is skipped with a warning and the key is released
/// immediately.
pub struct Session<D: 'static, E: 'static, T: Transform<D, E>> {
    consumer: ConsumerId,
    notifier: Option<Rc<Notifier<D, E, T>>>,
}

impl<D: 'static, E: 'static, T: Transform<D, E>> Session<D, E, T> {
    pub(crate) fn new(consumer: ConsumerId, notifier: Rc<Notifier<D, E, T>>) -> Self {
        Self {
            consumer,
            notifier: Some(notifier),
        }
    }

    /// Returns the consumer identity of this session.
    #[inline]
    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer
    }

    /// Returns the key.
    pub fn key(&self) -> Option<&Key> {
        self.notifier.as_ref().map(|n| n.key())
    }

    /// Returns the transform identity.
    pub fn transform_id(&self) -> Option<&TransformId> {
        self.notifier.as_ref().map(|n| n.transform_id())
    }

    /// Returns true until the session is closed.
    pub fn is_attached(&self) -> bool {
        self.notifier
            .as_ref()
            .is_some_and(|n| n.is_observing(self.consumer))
    }

    /// Returns the view's current fresh value, if any.
    pub fn current(&self) -> Option<Rc<CompressedCache<T::Data, T::Error>>> {
        let notifier = self.notifier.as_ref()?;
        if notifier.is_expired() {
            return None;
        }
        notifier.current()
    }

    /// Detaches the consumer.
    ///
    /// Returns false if it was already detached by other means.
    pub fn close(mut self) -> bool {
        self.detach()
    }

    fn detach(&mut self) -> bool {
        match self.notifier.take() {
            Some(notifier) => notifier.unsubscribe(self.consumer),
            None => false,
        }
    }
}

impl<D: 'static, E: 'static, T: Transform<D, E>> Drop for Session<D, E, T> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<D: 'static, E: 'static, T: Transform<D, E>> fmt::Debug for Session<D, E, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("consumer", &self.consumer)
            .field("key", &self.key())
            .field("transform", &self.transform_id())
            .finish()
    }
}
