// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use regex::Regex;

use crate::{CacheEntry, StoreError};

/// Selects keys for [`EntryStore::keys`](crate::EntryStore::keys).
///
/// # Examples
///
/// ```
/// use kpicache_tier::KeyFilter;
///
/// let filter = KeyFilter::pattern("kpi:*:dealershipId=?").unwrap();
/// assert!(filter.matches_key("kpi:leads:dealershipId=4"));
/// assert!(!filter.matches_key("kpi:leads:dealershipId=42"));
/// ```
#[derive(Clone)]
pub enum KeyFilter {
    /// Every key in the store.
    All,
    /// Keys whose entry carries the tag.
    Tag(String),
    /// Keys matching a glob where `*` matches any run of characters and `?` exactly one.
    Pattern(GlobPattern),
}

impl KeyFilter {
    /// Creates a tag filter.
    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Tag(tag.into())
    }

    /// Compiles a glob into a pattern filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the glob is empty or blank.
    pub fn pattern(glob: &str) -> Result<Self, StoreError> {
        GlobPattern::new(glob).map(Self::Pattern)
    }

    /// Returns true if `key` holding `entry` is selected.
    pub fn matches<V>(&self, key: &str, entry: &CacheEntry<V>) -> bool {
        match self {
            Self::All => true,
            Self::Tag(tag) => entry.has_tag(tag),
            Self::Pattern(glob) => glob.is_match(key),
        }
    }

    /// Returns true if `key` is selected without looking at its entry.
    ///
    /// Tag filters never match by key alone.
    #[must_use]
    pub fn matches_key(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Tag(_) => false,
            Self::Pattern(glob) => glob.is_match(key),
        }
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Tag(tag) => f.debug_tuple("Tag").field(tag).finish(),
            Self::Pattern(glob) => f.debug_tuple("Pattern").field(&glob.as_str()).finish(),
        }
    }
}

/// A compiled `*`/`?` glob.
#[derive(Clone)]
pub struct GlobPattern {
    glob: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compiles `glob`. Every character other than `*` and `?` matches literally.
    ///
    /// # Errors
    ///
    /// Returns an error if the glob is empty or blank.
    pub fn new(glob: &str) -> Result<Self, StoreError> {
        if glob.trim().is_empty() {
            return Err(StoreError::operation("filter", "glob pattern is empty"));
        }

        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        let mut literal = [0_u8; 4];
        for ch in glob.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut literal))),
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| StoreError::operation("filter", e.to_string()))?;
        Ok(Self {
            glob: glob.to_owned(),
            regex,
        })
    }

    /// Returns the glob this pattern was compiled from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.glob
    }

    /// Returns true if `text` matches the whole glob.
    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Returns true if the glob contains no wildcards.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        !self.glob.contains(['*', '?'])
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobPattern").field(&self.glob).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::ExpiryPolicy;

    #[test]
    fn star_matches_any_run() {
        let glob = GlobPattern::new("kpi:*").unwrap();
        assert!(glob.is_match("kpi:"));
        assert!(glob.is_match("kpi:leads:dealershipId=1"));
        assert!(!glob.is_match("http:kpi:leads"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let glob = GlobPattern::new("dealership_?").unwrap();
        assert!(glob.is_match("dealership_7"));
        assert!(!glob.is_match("dealership_"));
        assert!(!glob.is_match("dealership_77"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let glob = GlobPattern::new("a.b+(c)").unwrap();
        assert!(glob.is_match("a.b+(c)"));
        assert!(!glob.is_match("axb+(c)"));
        assert!(glob.is_literal());
    }

    #[test]
    fn blank_glob_is_rejected() {
        assert!(GlobPattern::new("").is_err());
        assert!(GlobPattern::new("   ").is_err());
    }

    #[test]
    fn tag_filter_matches_entry_tags() {
        let entry = CacheEntry::new(1, SystemTime::UNIX_EPOCH, ExpiryPolicy::default()).with_tags(["kpi"]);
        assert!(KeyFilter::tag("kpi").matches("any", &entry));
        assert!(!KeyFilter::tag("leads").matches("any", &entry));
        assert!(!KeyFilter::tag("kpi").matches_key("any"));
        assert!(KeyFilter::All.matches("any", &entry));
    }
}
