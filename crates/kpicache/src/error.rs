// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types surfaced by the cache service.

use std::{sync::Arc, time::Duration};

use kpicache_tier::StoreError;

/// Boxed error returned by loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error from a cache operation.
///
/// Errors are cloneable so that a single failed load can be handed to every
/// caller that was waiting on it. Loader failures are never cached.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The loader returned an error.
    #[error("loader failed: {0}")]
    Factory(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The loader did not finish within the factory timeout.
    #[error("loader timed out after {0:?}")]
    Timeout(Duration),

    /// The loader panicked.
    #[error("loader panicked: {0}")]
    FactoryPanicked(String),

    /// The load task was cancelled before it produced a value, typically during shutdown.
    #[error("load was cancelled")]
    Cancelled,

    /// A cache key could not be built or is not acceptable.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// An invalidation pattern could not be compiled.
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The in-memory store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    pub(crate) fn factory(error: BoxError) -> Self {
        Self::Factory(Arc::from(error))
    }

    /// Returns true if the error came from running a loader (failure, timeout, panic or cancellation).
    #[must_use]
    pub fn is_factory_failure(&self) -> bool {
        matches!(
            self,
            Self::Factory(_) | Self::Timeout(_) | Self::FactoryPanicked(_) | Self::Cancelled
        )
    }
}

/// An error in configuration or in an event mapping table.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A field holds a value outside its accepted range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The input is not valid JSON for the expected shape.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The mapping table declares a version this build does not understand.
    #[error("unsupported event mapping table version {0}, expected 1")]
    UnsupportedVersion(u32),

    /// A tag template is malformed.
    #[error("invalid tag template {template:?}: {reason}")]
    InvalidTemplate {
        /// The offending template.
        template: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The service was built outside a Tokio runtime.
    #[error("the cache service must be built inside a Tokio runtime")]
    NoRuntime,
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
