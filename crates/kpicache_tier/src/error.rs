// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for store operations.

use std::fmt;

/// Broad category of a store failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// The backend could not be reached (refused, dropped, timed out).
    Unavailable,
    /// The backend was reached but rejected or failed the operation.
    Operation,
    /// A payload could not be encoded or decoded.
    Serialization,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unavailable => "unavailable",
            Self::Operation => "operation failed",
            Self::Serialization => "serialization failed",
        })
    }
}

/// An error from a store operation.
///
/// Store errors are cheap to clone so they can be shared with every waiter of a
/// coalesced load.
///
/// # Examples
///
/// ```
/// use kpicache_tier::StoreError;
///
/// let error = StoreError::unavailable("redis", "connection refused");
/// assert!(error.is_unavailable());
/// assert_eq!(error.to_string(), "redis store unavailable: connection refused");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{store} store {kind}: {message}")]
pub struct StoreError {
    store: &'static str,
    kind: StoreErrorKind,
    message: String,
}

impl StoreError {
    /// Creates an error of the given kind.
    pub fn new(store: &'static str, kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            store,
            kind,
            message: message.into(),
        }
    }

    /// Creates an error signalling the backend is unreachable.
    pub fn unavailable(store: &'static str, message: impl Into<String>) -> Self {
        Self::new(store, StoreErrorKind::Unavailable, message)
    }

    /// Creates an error for a failed operation on a reachable backend.
    pub fn operation(store: &'static str, message: impl Into<String>) -> Self {
        Self::new(store, StoreErrorKind::Operation, message)
    }

    /// Creates an error for a payload that could not be encoded or decoded.
    pub fn serialization(store: &'static str, message: impl Into<String>) -> Self {
        Self::new(store, StoreErrorKind::Serialization, message)
    }

    /// Returns the name of the store that failed.
    #[must_use]
    pub fn store(&self) -> &'static str {
        self.store
    }

    /// Returns the failure category.
    #[must_use]
    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    /// Returns the detail message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the backend could not be reached.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.kind == StoreErrorKind::Unavailable
    }
}

/// A specialized [`Result`] type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_contains_store_kind_and_message() {
        let error = StoreError::serialization("memory", "bad payload");
        let text = error.to_string();
        assert!(text.contains("memory"), "got: {text}");
        assert!(text.contains("serialization failed"), "got: {text}");
        assert!(text.contains("bad payload"), "got: {text}");
    }

    #[test]
    fn only_unavailable_is_unavailable() {
        assert!(StoreError::unavailable("redis", "timeout").is_unavailable());
        assert!(!StoreError::operation("redis", "WRONGTYPE").is_unavailable());
        assert!(!StoreError::serialization("redis", "eof").is_unavailable());
    }

    #[test]
    fn result_type_alias_propagates_errors() {
        fn returns_err() -> Result<i32> {
            Err(StoreError::operation("mock", "expected failure"))
        }

        let err = returns_err().expect_err("should return an error");
        assert_eq!(err.kind(), StoreErrorKind::Operation);
        assert_eq!(err.store(), "mock");
        assert_eq!(err.message(), "expected failure");
    }
}
