// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Value producers and the options that travel with them.

use std::{fmt::Debug, sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};

use crate::BoxError;

type LoadFn<V> = dyn Fn() -> BoxFuture<'static, Result<V, BoxError>> + Send + Sync;

/// An async function that produces a value for a cache key.
///
/// Loaders are opaque to the cache: they may be slow and they may fail. A
/// loader is cheap to clone and may be invoked many times over its life, once
/// per miss, refresh or warm-up tick.
///
/// # Examples
///
/// ```
/// use kpicache::Loader;
///
/// let loader = Loader::new(|| async { Ok::<_, std::io::Error>(42_u64) });
/// # let _ = loader;
/// ```
pub struct Loader<V>(Arc<LoadFn<V>>);

impl<V> Loader<V> {
    /// Wraps an async closure as a loader.
    pub fn new<F, Fut, E>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError>,
        V: 'static,
    {
        Self(Arc::new(move || f().map(|result| result.map_err(Into::into)).boxed()))
    }

    /// Invokes the loader.
    pub(crate) fn load(&self) -> BoxFuture<'static, Result<V, BoxError>> {
        (self.0)()
    }
}

impl<V> Clone for Loader<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V> Debug for Loader<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader").finish_non_exhaustive()
    }
}

/// Write options for a loaded or explicitly set value.
///
/// # Examples
///
/// ```
/// use kpicache::LoadOptions;
/// use std::time::Duration;
///
/// let options = LoadOptions::new()
///     .ttl(Duration::from_secs(30))
///     .tag("kpi")
///     .tag("dealership_1")
///     .group("conversation_summary");
/// assert_eq!(options.tags_list(), ["kpi", "dealership_1"]);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    ttl: Option<Duration>,
    tags: Vec<String>,
    group: Option<String>,
}

impl LoadOptions {
    /// Creates options using the service's default TTL, no tags and no group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the TTL.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds several tags.
    #[must_use]
    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Sets the statistics group, typically the KPI name.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Returns the TTL override, if any.
    #[must_use]
    pub fn ttl_override(&self) -> Option<Duration> {
        self.ttl
    }

    /// Returns the tags.
    #[must_use]
    pub fn tags_list(&self) -> &[String] {
        &self.tags
    }

    /// Returns the statistics group, if any.
    #[must_use]
    pub fn group_name(&self) -> Option<&str> {
        self.group.as_deref()
    }
}

/// The result of a successful lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lookup<V> {
    /// The cached or freshly loaded value.
    pub value: V,
    /// True if the value is past its soft expiry. A refresh is requested when a loader is known for the key.
    pub stale: bool,
}

impl<V> Lookup<V> {
    pub(crate) fn fresh(value: V) -> Self {
        Self { value, stale: false }
    }

    pub(crate) fn stale(value: V) -> Self {
        Self { value, stale: true }
    }
}
