// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deterministic cache key construction.

use std::fmt::{Display, Write};

use crate::CacheError;

/// The tag attached to every KPI entry.
pub const KPI_TAG: &str = "kpi";

const DEFAULT_MAX_PARAMS_LEN: usize = 200;

/// Builds canonical cache keys from a namespace and a set of parameters.
///
/// Keys have the form `{prefix}:{namespace}:{name=value&name=value}`. Parameters
/// are sorted by name (then value) before they are joined, so logically equal
/// parameter sets produce identical keys whatever order they were supplied in.
/// The characters `%`, `&` and `=` are percent-escaped inside names and values.
///
/// # Examples
///
/// ```
/// use kpicache::KeyBuilder;
///
/// let keys = KeyBuilder::new("kpi");
/// let key = keys
///     .build("conversation_summary", [("period", "week"), ("dealershipId", "1")])
///     .unwrap();
/// assert_eq!(key, "kpi:conversation_summary:dealershipId=1&period=week");
///
/// let bare = keys.build("leaderboard", std::iter::empty::<(&str, &str)>()).unwrap();
/// assert_eq!(bare, "kpi:leaderboard");
/// ```
#[derive(Clone, Debug)]
pub struct KeyBuilder {
    prefix: String,
    max_params_len: usize,
}

impl KeyBuilder {
    /// Creates a builder that prepends `prefix` to every key. An empty prefix is omitted.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            max_params_len: DEFAULT_MAX_PARAMS_LEN,
        }
    }

    /// Sets the length above which the parameter segment is replaced by its hash.
    #[must_use]
    pub fn max_params_len(mut self, len: usize) -> Self {
        self.max_params_len = len;
        self
    }

    /// Returns the configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Builds the key for `namespace` and `params`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidKey`] if the namespace is empty or contains
    /// `:` or whitespace, or if a parameter name is empty.
    pub fn build<I, K, V>(&self, namespace: &str, params: I) -> Result<String, CacheError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Display,
    {
        validate_namespace(namespace)?;

        let mut pairs = params
            .into_iter()
            .map(|(name, value)| {
                let name = name.as_ref();
                if name.is_empty() {
                    return Err(CacheError::InvalidKey(format!("empty parameter name in namespace {namespace:?}")));
                }
                Ok((escape(name), escape(&value.to_string())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        pairs.sort_unstable();

        let mut key = String::new();
        if !self.prefix.is_empty() {
            key.push_str(&self.prefix);
            key.push(':');
        }
        key.push_str(namespace);

        if pairs.is_empty() {
            return Ok(key);
        }

        let mut canonical = String::new();
        for (index, (name, value)) in pairs.iter().enumerate() {
            if index > 0 {
                canonical.push('&');
            }
            canonical.push_str(name);
            canonical.push('=');
            canonical.push_str(value);
        }

        key.push(':');
        if canonical.len() > self.max_params_len {
            let _ = write!(key, "{:016x}", xxhash_rust::xxh3::xxh3_64(canonical.as_bytes()));
        } else {
            key.push_str(&canonical);
        }
        Ok(key)
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("")
    }
}

/// Returns the tag covering every entry of one dealership.
#[must_use]
pub fn dealership_tag(dealership_id: impl Display) -> String {
    format!("dealership_{dealership_id}")
}

/// Returns the tag covering one KPI of one dealership.
#[must_use]
pub fn kpi_dealership_tag(kpi: &str, dealership_id: impl Display) -> String {
    format!("{kpi}_dealership_{dealership_id}")
}

fn validate_namespace(namespace: &str) -> Result<(), CacheError> {
    if namespace.is_empty() {
        return Err(CacheError::InvalidKey("namespace is empty".to_owned()));
    }
    if namespace.contains(':') || namespace.contains(char::is_whitespace) {
        return Err(CacheError::InvalidKey(format!(
            "namespace {namespace:?} must not contain ':' or whitespace"
        )));
    }
    Ok(())
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '&' => escaped.push_str("%26"),
            '=' => escaped.push_str("%3D"),
            c => escaped.push(c),
        }
    }
    escaped
}
