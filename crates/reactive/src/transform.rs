//! Transforms (middleware) deriving compressed views from the raw feed.
//!
//! A transform receives the raw cache of a key and decides whether and how
//! to emit compressed `(data, error)` pairs through a [`Sink`]. Emitting
//! nothing suppresses the notification.

use core::marker::PhantomData;
use std::fmt;
use std::rc::Rc;

use keysync_core::{BoxError, CacheEntry, RawCache, TransformId};

/// Collects the compressed entries a transform emits.
pub struct Sink<C, CE> {
    emitted: Vec<CacheEntry<C, CE>>,
}

impl<C, CE> Default for Sink<C, CE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, CE> Sink<C, CE> {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self {
            emitted: Vec::new(),
        }
    }

    /// Emits a compressed data/error pair.
    #[inline]
    pub fn notify(&mut self, data: Option<C>, error: Option<CE>) {
        self.emit(CacheEntry::new(data, error));
    }

    /// Emits a compressed entry.
    #[inline]
    pub fn emit(&mut self, entry: CacheEntry<C, CE>) {
        self.emitted.push(entry);
    }

    /// Returns the number of emitted entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.emitted.len()
    }

    /// Returns true if nothing was emitted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.emitted.is_empty()
    }

    /// Consumes the sink, returning the emitted entries in order.
    pub fn into_entries(self) -> Vec<CacheEntry<C, CE>> {
        self.emitted
    }
}

/// Derives a compressed view from a key's raw feed.
///
/// Implementations run synchronously inside the fan-out. Returning an error
/// (or panicking) is isolated to the notifier owning the transform: the
/// entries emitted before the failure are still delivered, sibling views
/// are unaffected.
///
/// One transform instance may serve many keys. Anything it remembers
/// between updates lives in [`Transform::State`], which every notifier owns
/// separately and resets before replaying the raw cache to a joining
/// observer.
pub trait Transform<D, E>: 'static {
    /// Compressed data type.
    type Data: 'static;
    /// Compressed error type.
    type Error: 'static;
    /// Per-notifier memory of the transform.
    type State: Default + 'static;

    /// Transforms one raw update.
    fn apply(
        &self,
        state: &mut Self::State,
        raw: &RawCache<D, E>,
        sink: &mut Sink<Self::Data, Self::Error>,
    ) -> Result<(), BoxError>;

    /// Whether a freshly registered notifier replays the existing raw cache
    /// through this transform before accepting observers.
    fn seeds_on_register(&self) -> bool {
        true
    }
}

/// Passes the raw feed through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl<D: Clone + 'static, E: Clone + 'static> Transform<D, E> for Identity {
    type Data = D;
    type Error = E;
    type State = ();

    fn apply(
        &self,
        _: &mut (),
        raw: &RawCache<D, E>,
        sink: &mut Sink<D, E>,
    ) -> Result<(), BoxError> {
        sink.emit(raw.clone());
        Ok(())
    }
}

/// Maps every raw update to a compressed entry and always emits it.
pub struct Map<F, C, CE> {
    map: F,
    _marker: PhantomData<fn() -> (C, CE)>,
}

impl<F, C, CE> Map<F, C, CE> {
    /// Creates a mapping transform.
    pub fn new<D, E>(map: F) -> Self
    where
        F: Fn(&RawCache<D, E>) -> CacheEntry<C, CE>,
    {
        Self {
            map,
            _marker: PhantomData,
        }
    }
}

impl<D, E, F, C, CE> Transform<D, E> for Map<F, C, CE>
where
    F: Fn(&RawCache<D, E>) -> CacheEntry<C, CE> + 'static,
    C: 'static,
    CE: 'static,
{
    type Data = C;
    type Error = CE;
    type State = ();

    fn apply(
        &self,
        _: &mut (),
        raw: &RawCache<D, E>,
        sink: &mut Sink<C, CE>,
    ) -> Result<(), BoxError> {
        sink.emit((self.map)(raw));
        Ok(())
    }
}

/// Maps every raw update and suppresses the notification when the result
/// equals the last entry emitted by the same notifier.
pub struct Distinct<F, C, CE> {
    map: F,
    _marker: PhantomData<fn() -> (C, CE)>,
}

impl<F, C, CE> Distinct<F, C, CE> {
    /// Creates a de-duplicating mapping transform.
    pub fn new<D, E>(map: F) -> Self
    where
        F: Fn(&RawCache<D, E>) -> CacheEntry<C, CE>,
    {
        Self {
            map,
            _marker: PhantomData,
        }
    }
}

impl<D, E, F, C, CE> Transform<D, E> for Distinct<F, C, CE>
where
    F: Fn(&RawCache<D, E>) -> CacheEntry<C, CE> + 'static,
    C: Clone + PartialEq + 'static,
    CE: Clone + PartialEq + 'static,
{
    type Data = C;
    type Error = CE;
    type State = Option<CacheEntry<C, CE>>;

    fn apply(
        &self,
        last: &mut Self::State,
        raw: &RawCache<D, E>,
        sink: &mut Sink<C, CE>,
    ) -> Result<(), BoxError> {
        let next = (self.map)(raw);
        if last.as_ref() == Some(&next) {
            return Ok(());
        }
        *last = Some(next.clone());
        sink.emit(next);
        Ok(())
    }
}

/// Transform built from a closure with full access to the sink.
pub struct FromFn<F, C, CE> {
    apply: F,
    seed: bool,
    _marker: PhantomData<fn() -> (C, CE)>,
}

impl<F, C, CE> FromFn<F, C, CE> {
    /// Creates a transform from a closure.
    pub fn new<D, E>(apply: F) -> Self
    where
        F: Fn(&RawCache<D, E>, &mut Sink<C, CE>) -> Result<(), BoxError>,
    {
        Self {
            apply,
            seed: true,
            _marker: PhantomData,
        }
    }

    /// Skips the registration-time replay of the existing raw cache.
    pub fn without_seed(mut self) -> Self {
        self.seed = false;
        self
    }
}

impl<D, E, F, C, CE> Transform<D, E> for FromFn<F, C, CE>
where
    F: Fn(&RawCache<D, E>, &mut Sink<C, CE>) -> Result<(), BoxError> + 'static,
    C: 'static,
    CE: 'static,
{
    type Data = C;
    type Error = CE;
    type State = ();

    fn apply(
        &self,
        _: &mut (),
        raw: &RawCache<D, E>,
        sink: &mut Sink<C, CE>,
    ) -> Result<(), BoxError> {
        (self.apply)(raw, sink)
    }

    fn seeds_on_register(&self) -> bool {
        self.seed
    }
}

/// A transform paired with its stable identity token.
///
/// Views are cheap to clone; every clone shares the transform instance, and
/// so does every key the view is attached on.
pub struct View<T> {
    id: TransformId,
    transform: Rc<T>,
}

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            transform: Rc::clone(&self.transform),
        }
    }
}

impl<T> fmt::Debug for View<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View").field("id", &self.id).finish()
    }
}

impl<T> View<T> {
    /// Creates a view.
    pub fn new(id: impl Into<TransformId>, transform: T) -> Self {
        Self {
            id: id.into(),
            transform: Rc::new(transform),
        }
    }

    /// Returns the identity token.
    #[inline]
    pub fn id(&self) -> &TransformId {
        &self.id
    }

    /// Returns the shared transform.
    #[inline]
    pub fn transform(&self) -> &Rc<T> {
        &self.transform
    }
}
