//! Consumer and transform identities.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global consumer ID counter.
static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one consumer (one UI component instance).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl ConsumerId {
    /// Allocates a process-unique consumer ID.
    pub fn next() -> Self {
        Self(NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps an externally managed ID.
    ///
    /// Callers mixing raw IDs with [`ConsumerId::next`] are responsible for
    /// keeping them distinct.
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable identity token of a transform.
///
/// Notifiers are registered per `(Key, TransformId)`; two registrations with
/// the same token share one notifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransformId(Cow<'static, str>);

impl TransformId {
    /// Creates a transform ID from a static name.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Creates a transform ID from an owned or static name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// Returns the name of this transform.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for TransformId {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for TransformId {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}
