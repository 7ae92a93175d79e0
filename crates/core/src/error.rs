//! Error types for the keysync engine.

use crate::ids::{ConsumerId, TransformId};
use crate::key::Key;
use thiserror::Error;

/// Boxed error returned by user-supplied fetch, stop and transform functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for keysync operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported by the keysync engine.
///
/// Failures of user-supplied functions never abort a fan-out. They are
/// converted into one of these variants and logged where they happen.
#[derive(Debug, Error)]
pub enum Error {
    /// The user fetch function failed.
    #[error("fetch failed for key `{key}`: {source}")]
    FetchFailed {
        key: Key,
        #[source]
        source: BoxError,
    },
    /// The user stop function failed; upstream resources may leak.
    #[error("stop failed for key `{key}`, upstream resources may leak: {source}")]
    StopFailed {
        key: Key,
        #[source]
        source: BoxError,
    },
    /// A transform returned an error.
    #[error("transform `{transform}` failed for key `{key}`: {source}")]
    TransformFailed {
        key: Key,
        transform: TransformId,
        #[source]
        source: BoxError,
    },
    /// A transform panicked.
    #[error("transform `{transform}` panicked for key `{key}`")]
    TransformPanicked { key: Key, transform: TransformId },
    /// An observer callback panicked.
    #[error("observer {consumer} of `{transform}` panicked for key `{key}`")]
    ObserverPanicked {
        key: Key,
        transform: TransformId,
        consumer: ConsumerId,
    },
    /// A transform ID was reused with a different transform type.
    #[error("transform `{transform}` is registered for key `{key}` with a different type")]
    TransformMismatch { key: Key, transform: TransformId },
    /// The consumer is already attached to this view.
    #[error("consumer {consumer} is already attached to `{transform}` for key `{key}`")]
    AlreadyAttached {
        key: Key,
        transform: TransformId,
        consumer: ConsumerId,
    },
    /// The subscriber owning a notifier was evicted from its pool.
    #[error("subscriber of key `{key}` is gone, `{transform}` cannot be attached")]
    SubscriberGone { key: Key, transform: TransformId },
    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl Error {
    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns the key this error relates to, if any.
    pub fn key(&self) -> Option<&Key> {
        match self {
            Error::FetchFailed { key, .. }
            | Error::StopFailed { key, .. }
            | Error::TransformFailed { key, .. }
            | Error::TransformPanicked { key, .. }
            | Error::ObserverPanicked { key, .. }
            | Error::TransformMismatch { key, .. }
            | Error::AlreadyAttached { key, .. }
            | Error::SubscriberGone { key, .. } => Some(key),
            Error::InvalidConfig { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = Error::StopFailed {
            key: Key::from("feed"),
            source: "socket already closed".into(),
        };
        let message = err.to_string();
        assert!(message.contains("feed"));
        assert!(message.contains("may leak"));
        assert!(err.source().is_some());

        let err = Error::invalid_config("interval must be positive");
        assert!(err.to_string().contains("interval"));
        assert!(err.key().is_none());
    }

    #[test]
    fn test_error_key() {
        let err = Error::TransformPanicked {
            key: Key::from("feed"),
            transform: TransformId::from_static("static"),
        };
        assert_eq!(err.key().map(Key::as_str), Some("feed"));
    }
}
