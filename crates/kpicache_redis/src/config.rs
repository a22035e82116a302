// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection settings for [`RedisStore`](crate::RedisStore).
///
/// Loadable from JSON; missing fields take their defaults.
///
/// # Examples
///
/// ```
/// use kpicache_redis::RedisConfig;
/// use std::time::Duration;
///
/// let config: RedisConfig = serde_json::from_str(r#"{ "url": "redis://cache:6379" }"#).unwrap();
/// assert_eq!(config.url, "redis://cache:6379");
/// assert_eq!(config.key_prefix, "kpicache:");
/// assert_eq!(config.connect_timeout(), Duration::from_secs(1));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, for example `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Prepended to every Redis key written by the store.
    pub key_prefix: String,
    /// Upper bound on establishing the connection, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_owned(),
            key_prefix: "kpicache:".to_owned(),
            connect_timeout_ms: 1000,
        }
    }
}

impl RedisConfig {
    /// Creates a configuration for `url` with default prefix and timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Returns the connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
