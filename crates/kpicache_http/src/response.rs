// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Response, StatusCode, header, response};
use http_body_util::Full;
use serde::{Deserialize, Serialize};

/// Response header reporting whether a response came from the cache.
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// A buffered HTTP response as it is stored in the cache.
///
/// Header values that are not valid UTF-8 are dropped, as are the
/// `x-cache` marker and hop-by-hop headers that describe a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl CachedResponse {
    /// Captures the status, headers and body of a response.
    #[must_use]
    pub fn from_parts(parts: &response::Parts, body: Bytes) -> Self {
        let headers = parts
            .headers
            .iter()
            .filter(|(name, _)| is_storable(name))
            .filter_map(|(name, value)| Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned())))
            .collect();

        Self {
            status: parts.status.as_u16(),
            headers,
            body,
        }
    }

    /// The stored status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    /// The stored headers in their original order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// The stored body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Rebuilds a response, tagging it with the given `x-cache` marker.
    #[must_use]
    pub fn to_response(&self, marker: &'static str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body.clone()));
        *response.status_mut() = self.status();

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                headers.append(name, value);
            }
        }
        headers.insert(X_CACHE, HeaderValue::from_static(marker));
        response
    }
}

fn is_storable(name: &HeaderName) -> bool {
    *name != X_CACHE
        && *name != header::CONNECTION
        && *name != header::TRANSFER_ENCODING
        && *name != header::TE
        && *name != header::TRAILER
        && *name != header::UPGRADE
        && *name != header::PROXY_AUTHENTICATE
}
