// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::Serialize;

/// Which tiers back the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Only the in-process tier is configured.
    Memory,
    /// A distributed tier is configured behind the in-process tier.
    Distributed,
}

/// The result of [`CacheService::health_check`](crate::CacheService::health_check).
///
/// # Examples
///
/// ```
/// use kpicache::{Backend, Health};
///
/// let health = Health { backend: Backend::Distributed, degraded: true };
/// assert_eq!(
///     serde_json::to_string(&health).unwrap(),
///     r#"{"backend":"distributed","degraded":true}"#
/// );
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Health {
    /// The configured backend.
    pub backend: Backend,
    /// True while the distributed tier is unreachable and reads are served from memory only.
    pub degraded: bool,
}
