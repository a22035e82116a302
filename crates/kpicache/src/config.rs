// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use kpicache_tier::ExpiryPolicy;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Settings for a [`CacheService`](crate::CacheService).
///
/// Durations are expressed in milliseconds so the configuration reads naturally
/// as JSON. Every field has a default, so an empty object is a valid configuration.
///
/// # Examples
///
/// ```
/// use kpicache::CacheConfig;
/// use std::time::Duration;
///
/// let config = CacheConfig::from_json(r#"{ "key_prefix": "kpi", "default_ttl_ms": 30000 }"#).unwrap();
/// assert_eq!(config.default_ttl(), Duration::from_secs(30));
/// assert_eq!(config.distributed_timeout(), Duration::from_millis(250));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Leading segment of keys produced by the service's key builder; empty for none.
    pub key_prefix: String,
    /// TTL applied when a write does not specify one.
    pub default_ttl_ms: u64,
    /// Fraction of the TTL during which an entry is fresh, in `(0, 1]`.
    pub soft_ratio: f64,
    /// Upper bound on a single loader call.
    pub factory_timeout_ms: u64,
    /// Upper bound on a single call to the distributed store.
    pub distributed_timeout_ms: u64,
    /// How often an unavailable distributed store is probed.
    pub probe_interval_ms: u64,
    /// How often hard-expired entries are swept from memory.
    pub sweep_interval_ms: u64,
    /// Latency below which a lookup counts as fast in statistics.
    pub latency_threshold_ms: u64,
    /// Maximum number of entries held in memory.
    pub memory_max_capacity: u64,
    /// Canonical parameter strings longer than this many bytes are replaced by a hash.
    pub max_params_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            default_ttl_ms: 300_000,
            soft_ratio: 0.8,
            factory_timeout_ms: 10_000,
            distributed_timeout_ms: 250,
            probe_interval_ms: 5_000,
            sweep_interval_ms: 30_000,
            latency_threshold_ms: 50,
            memory_max_capacity: 100_000,
            max_params_len: 200,
        }
    }
}

impl CacheConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a value is out of range.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first field with an unusable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.soft_ratio > 0.0 && self.soft_ratio <= 1.0) {
            return Err(ConfigError::invalid("soft_ratio", format!("{} is outside (0, 1]", self.soft_ratio)));
        }

        let durations = [
            ("default_ttl_ms", self.default_ttl_ms),
            ("factory_timeout_ms", self.factory_timeout_ms),
            ("distributed_timeout_ms", self.distributed_timeout_ms),
            ("probe_interval_ms", self.probe_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::invalid(field, "must be greater than zero"));
        }

        if self.memory_max_capacity == 0 {
            return Err(ConfigError::invalid("memory_max_capacity", "must be greater than zero"));
        }

        if self.key_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::invalid("key_prefix", "must not contain whitespace"));
        }

        Ok(())
    }

    /// Returns the default TTL.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Returns the loader timeout.
    #[must_use]
    pub fn factory_timeout(&self) -> Duration {
        Duration::from_millis(self.factory_timeout_ms)
    }

    /// Returns the distributed call timeout.
    #[must_use]
    pub fn distributed_timeout(&self) -> Duration {
        Duration::from_millis(self.distributed_timeout_ms)
    }

    /// Returns the reconnect probe interval.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Returns the expiry sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Returns the fast-lookup threshold.
    #[must_use]
    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }

    /// Returns the expiry policy for the default TTL.
    #[must_use]
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(self.default_ttl(), self.soft_ratio)
    }
}
