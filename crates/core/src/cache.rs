//! Cache values.
//!
//! A [`CacheEntry`] is the last `(data, error)` pair observed for a key or a
//! derived view. A [`CacheSlot`] holds the current entry together with the
//! freshness flag the engine uses to decide whether an entry may be
//! replayed or must be cleared.

use std::rc::Rc;

/// The last data/error pair observed for a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry<D, E> {
    /// Last delivered data, if any.
    pub data: Option<D>,
    /// Last delivered error, if any.
    pub error: Option<E>,
}

/// Raw cache of a key, as delivered by the fetch function.
pub type RawCache<D, E> = CacheEntry<D, E>;

/// Compressed cache of a derived view, as produced by its transform.
pub type CompressedCache<C, CE> = CacheEntry<C, CE>;

impl<D, E> Default for CacheEntry<D, E> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<D, E> CacheEntry<D, E> {
    /// Creates an entry from a data/error pair.
    #[inline]
    pub fn new(data: Option<D>, error: Option<E>) -> Self {
        Self { data, error }
    }

    /// Creates an entry holding neither data nor error.
    #[inline]
    pub const fn empty() -> Self {
        Self {
            data: None,
            error: None,
        }
    }

    /// Creates an entry holding only data.
    #[inline]
    pub fn with_data(data: D) -> Self {
        Self::new(Some(data), None)
    }

    /// Creates an entry holding only an error.
    #[inline]
    pub fn with_error(error: E) -> Self {
        Self::new(None, Some(error))
    }

    /// Returns true if neither data nor error is present.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.error.is_none()
    }

    /// Returns the data, if any.
    #[inline]
    pub fn data(&self) -> Option<&D> {
        self.data.as_ref()
    }

    /// Returns the error, if any.
    #[inline]
    pub fn error(&self) -> Option<&E> {
        self.error.as_ref()
    }
}

/// A shared cache entry plus its freshness flag.
///
/// The entry is stored behind an `Rc` so readers can take a snapshot and
/// release any borrow before running user code against it.
#[derive(Debug)]
pub struct CacheSlot<D, E> {
    entry: Rc<CacheEntry<D, E>>,
    expired: bool,
}

impl<D, E> Default for CacheSlot<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, E> CacheSlot<D, E> {
    /// Creates an empty, fresh slot.
    pub fn new() -> Self {
        Self {
            entry: Rc::new(CacheEntry::empty()),
            expired: false,
        }
    }

    /// Stores a new entry and marks the slot fresh.
    pub fn store(&mut self, entry: CacheEntry<D, E>) {
        self.entry = Rc::new(entry);
        self.expired = false;
    }

    /// Returns a snapshot of the current entry.
    #[inline]
    pub fn entry(&self) -> Rc<CacheEntry<D, E>> {
        Rc::clone(&self.entry)
    }

    /// Returns true if the slot holds data or an error.
    #[inline]
    pub fn has_value(&self) -> bool {
        !self.entry.is_empty()
    }

    /// Returns whether the slot is marked expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Marks the slot expired without touching the entry.
    #[inline]
    pub fn expire(&mut self) {
        self.expired = true;
    }

    /// Marks the slot fresh without touching the entry.
    #[inline]
    pub fn refresh(&mut self) {
        self.expired = false;
    }

    /// Drops the entry. The slot is fresh and empty afterwards.
    pub fn clear(&mut self) {
        self.entry = Rc::new(CacheEntry::empty());
        self.expired = false;
    }
}
