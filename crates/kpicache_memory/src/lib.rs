// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! In-process kpicache tier backed by moka.
//!
//! This crate provides [`InMemoryStore`], a concurrent store using moka's
//! `TinyLFU` eviction. It implements [`kpicache_tier::EntryStore`] with atomic
//! version-guarded writes. Use [`InMemoryStoreBuilder`] to configure capacity
//! without exposing moka types.
//!
//! # Quick Start
//!
//! ```
//! use kpicache_memory::InMemoryStoreBuilder;
//! use kpicache_tier::{CacheEntry, EntryStore, ExpiryPolicy};
//! use std::time::SystemTime;
//!
//! # futures::executor::block_on(async {
//! let store = InMemoryStoreBuilder::<i32>::new().max_capacity(1000).build();
//!
//! let entry = CacheEntry::new(42, SystemTime::now(), ExpiryPolicy::default()).with_version(1);
//! assert!(store.insert("key", entry).await.unwrap());
//!
//! // An older write never replaces a newer one.
//! let stale = CacheEntry::new(7, SystemTime::now(), ExpiryPolicy::default());
//! assert!(!store.insert("key", stale).await.unwrap());
//! assert_eq!(*store.get("key").await.unwrap().unwrap().value(), 42);
//! # });
//! ```

pub mod builder;
pub mod store;

#[doc(inline)]
pub use builder::InMemoryStoreBuilder;
#[doc(inline)]
pub use store::InMemoryStore;
