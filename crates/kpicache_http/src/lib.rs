// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Tower middleware caching HTTP responses in a [`kpicache::CacheService`].
//!
//! [`ResponseCacheLayer`] wraps any tower service handling [`http::Request`]s.
//! GET responses with a 2xx or 3xx status are buffered and stored, keyed by
//! method, path and sorted query parameters, so `?a=1&b=2` and `?b=2&a=1`
//! share an entry. Every cached or freshly produced response carries an
//! `x-cache` header of `HIT` or `MISS`.
//!
//! Stored responses take part in the service's tag and event invalidation like
//! any other value: give the layer a tag function and an ETL event that
//! invalidates `dealership_7` also drops the dashboard pages built for it.
//!
//! ```
//! use std::convert::Infallible;
//!
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use http_body_util::Full;
//! use kpicache::{CacheConfig, CacheService};
//! use kpicache_http::{CachedResponse, ResponseCacheLayer, X_CACHE};
//! use tower::{ServiceBuilder, ServiceExt, service_fn};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = CacheService::<CachedResponse>::init(CacheConfig::default()).unwrap();
//! let service = ServiceBuilder::new()
//!     .layer(ResponseCacheLayer::new(cache))
//!     .service(service_fn(|_req: Request<Full<Bytes>>| async {
//!         Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"42"))))
//!     }));
//!
//! let request = || Request::get("/kpi/leads?dealership_id=7").body(Full::default()).unwrap();
//! let first = service.clone().oneshot(request()).await.unwrap();
//! let second = service.oneshot(request()).await.unwrap();
//! assert_eq!(first.headers()[X_CACHE], "MISS");
//! assert_eq!(second.headers()[X_CACHE], "HIT");
//! # }
//! ```

mod layer;
mod response;

pub use layer::{HTTP_NAMESPACE, ResponseCache, ResponseCacheFuture, ResponseCacheLayer};
pub use response::{CachedResponse, X_CACHE};
