// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Storage contract for the kpicache tiers.
//!
//! This crate defines the [`EntryStore`] trait that every cache backend satisfies,
//! along with [`CacheEntry`] (a value plus its expiry window, tags and version),
//! [`KeyFilter`] for key scans, [`StoreError`] for fallible operations and the
//! [`Clock`] used to stamp entries.
//!
//! # Overview
//!
//! Storage is kept separate from caching behavior. Implement [`EntryStore`] for a
//! backend, then hand it to the `kpicache` service, which layers tiering, tag
//! indexing, single-flight loading and stale-while-revalidate on top.
//!
//! Every store honors two write rules:
//!
//! - [`EntryStore::insert`] never replaces an entry holding a higher version.
//! - [`EntryStore::compare_and_insert`] replaces an entry only when its version
//!   still equals the expected one.
//!
//! # Dynamic Dispatch
//!
//! The `dynamic-store` feature (on by default) provides [`DynamicStore`], a clonable
//! type-erased store. The service composes its memory and distributed tiers through it.

mod clock;
mod entry;
pub mod error;
mod filter;
#[cfg(any(feature = "test-util", test))]
pub mod testing;
pub(crate) mod tier;

#[cfg(feature = "dynamic-store")]
mod dynamic;

#[cfg(any(feature = "test-util", test))]
#[doc(inline)]
pub use clock::ClockControl;
#[doc(inline)]
pub use clock::Clock;
#[cfg(feature = "dynamic-store")]
#[doc(inline)]
pub use dynamic::{DynamicStore, DynamicStoreExt};
#[doc(inline)]
pub use entry::{CacheEntry, EntryState, ExpiryPolicy};
#[doc(inline)]
pub use error::{Result, StoreError, StoreErrorKind};
#[doc(inline)]
pub use filter::{GlobPattern, KeyFilter};
#[doc(inline)]
pub use tier::EntryStore;
