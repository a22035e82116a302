// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Redis-backed distributed tier for kpicache.
//!
//! [`RedisStore`] implements [`kpicache_tier::EntryStore`] on top of a Redis
//! `ConnectionManager`. Values travel as JSON, so the cached type must
//! implement `serde::Serialize` and `serde::de::DeserializeOwned`.
//!
//! Failures that indicate the server cannot be reached are reported as
//! [`StoreErrorKind::Unavailable`](kpicache_tier::StoreErrorKind::Unavailable);
//! the caching service reacts to those by serving from memory until a probe
//! succeeds.

mod config;
mod store;

#[doc(inline)]
pub use config::RedisConfig;
#[doc(inline)]
pub use store::RedisStore;
