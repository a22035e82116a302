// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, request};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use kpicache::{BoxError, CacheService};
use tower_layer::Layer;

use crate::response::{CachedResponse, X_CACHE};

/// Namespace of the keys built for GET requests.
pub const HTTP_NAMESPACE: &str = "http";

type KeyFn = dyn Fn(&request::Parts) -> Option<String> + Send + Sync;
type TagsFn = dyn Fn(&request::Parts) -> Vec<String> + Send + Sync;

/// Builds [`ResponseCache`] middleware around a shared [`CacheService`].
///
/// By default only GET requests are cached, keyed by method, path and the
/// sorted query parameters. Responses with a 2xx or 3xx status are stored
/// with the service's default TTL and without tags.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use kpicache::{CacheConfig, CacheService};
/// use kpicache_http::{CachedResponse, ResponseCacheLayer};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = CacheService::<CachedResponse>::init(CacheConfig::default()).unwrap();
/// let layer = ResponseCacheLayer::new(cache)
///     .ttl(Duration::from_secs(60))
///     .tags(|parts| vec![format!("route_{}", parts.uri.path().trim_matches('/'))]);
/// # let _ = layer;
/// # }
/// ```
#[derive(Clone)]
pub struct ResponseCacheLayer {
    cache: CacheService<CachedResponse>,
    policy: Policy,
}

#[derive(Clone, Default)]
struct Policy {
    ttl: Option<Duration>,
    key: Option<Arc<KeyFn>>,
    tags: Option<Arc<TagsFn>>,
}

impl ResponseCacheLayer {
    /// Creates a layer storing responses in `cache`.
    #[must_use]
    pub fn new(cache: CacheService<CachedResponse>) -> Self {
        Self {
            cache,
            policy: Policy::default(),
        }
    }

    /// Sets the TTL of stored responses.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.policy.ttl = Some(ttl);
        self
    }

    /// Replaces the key function.
    ///
    /// The function sees every request regardless of its method. Returning
    /// `None` passes the request through uncached.
    #[must_use]
    pub fn key<F>(mut self, key: F) -> Self
    where
        F: Fn(&request::Parts) -> Option<String> + Send + Sync + 'static,
    {
        self.policy.key = Some(Arc::new(key));
        self
    }

    /// Sets the function computing the tags of a stored response.
    #[must_use]
    pub fn tags<F>(mut self, tags: F) -> Self
    where
        F: Fn(&request::Parts) -> Vec<String> + Send + Sync + 'static,
    {
        self.policy.tags = Some(Arc::new(tags));
        self
    }
}

impl Debug for ResponseCacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCacheLayer")
            .field("ttl", &self.policy.ttl)
            .field("custom_key", &self.policy.key.is_some())
            .field("tags", &self.policy.tags.is_some())
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for ResponseCacheLayer {
    type Service = ResponseCache<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ResponseCache {
            shared: Arc::new(Shared {
                cache: self.cache.clone(),
                policy: self.policy.clone(),
            }),
            inner,
        }
    }
}

/// Caches the responses of the wrapped service.
///
/// Hits are answered from the cache with `x-cache: HIT`. Misses call the
/// inner service, buffer its body and answer with `x-cache: MISS`. Cache
/// failures are logged and the request is handled by the inner service.
pub struct ResponseCache<S> {
    shared: Arc<Shared>,
    inner: S,
}

struct Shared {
    cache: CacheService<CachedResponse>,
    policy: Policy,
}

impl<S: Clone> Clone for ResponseCache<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            inner: self.inner.clone(),
        }
    }
}

impl<S: Debug> Debug for ResponseCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl Shared {
    fn key_for(&self, parts: &request::Parts) -> Option<String> {
        if let Some(key) = &self.policy.key {
            return key(parts);
        }
        if parts.method != Method::GET {
            return None;
        }

        let query = parts.uri.query().unwrap_or_default();
        let params = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (format!("q.{name}"), value.to_owned())
            })
            .chain([
                ("method".to_owned(), parts.method.to_string()),
                ("path".to_owned(), parts.uri.path().to_owned()),
            ]);

        match self.cache.keys().build(HTTP_NAMESPACE, params) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, uri = %parts.uri, "response not cacheable");
                None
            }
        }
    }

    fn tags_for(&self, parts: &request::Parts) -> Vec<String> {
        self.policy.tags.as_ref().map(|tags| tags(parts)).unwrap_or_default()
    }
}

/// Future returned by [`ResponseCache`].
pub struct ResponseCacheFuture {
    inner: Pin<Box<dyn Future<Output = Result<Response<Full<Bytes>>, BoxError>> + Send>>,
}

impl Debug for ResponseCacheFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCacheFuture").finish_non_exhaustive()
    }
}

impl Future for ResponseCacheFuture {
    type Output = Result<Response<Full<Bytes>>, BoxError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<S, ReqBody, ResBody> tower_service::Service<Request<ReqBody>> for ResponseCache<S>
where
    S: tower_service::Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Body + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = ResponseCacheFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The readied service handles this request; the clone waits for the next one.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let (parts, body) = req.into_parts();
        let Some(key) = self.shared.key_for(&parts) else {
            let future = inner.call(Request::from_parts(parts, body));
            return ResponseCacheFuture {
                inner: Box::pin(async move {
                    let response = future.await.map_err(Into::into)?;
                    buffer(response).await.map(|(parts, bytes)| Response::from_parts(parts, Full::new(bytes)))
                }),
            };
        };
        let tags = self.shared.tags_for(&parts);
        let req = Request::from_parts(parts, body);
        let shared = Arc::clone(&self.shared);

        ResponseCacheFuture {
            inner: Box::pin(async move {
                match shared.cache.get(&key).await {
                    Ok(Some(lookup)) => return Ok(lookup.value.to_response("HIT")),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, key = key.as_str(), "cache read failed, calling through"),
                }

                let response = inner.call(req).await.map_err(Into::into)?;
                let (mut parts, bytes) = buffer(response).await?;

                if parts.status.is_success() || parts.status.is_redirection() {
                    let cached = CachedResponse::from_parts(&parts, bytes.clone());
                    if let Err(e) = shared.cache.set(&key, cached, shared.policy.ttl, tags).await {
                        tracing::warn!(error = %e, key = key.as_str(), "failed to store response");
                    }
                }

                parts.headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
                Ok(Response::from_parts(parts, Full::new(bytes)))
            }),
        }
    }
}

async fn buffer<B>(response: Response<B>) -> Result<(http::response::Parts, Bytes), BoxError>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.map_err(Into::into)?.to_bytes();
    Ok((parts, bytes))
}
