// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

/// Bidirectional mapping between tags and the keys they cover.
///
/// Both directions live behind one lock so a reader never sees a key listed
/// under a tag that the key itself no longer carries.
#[derive(Debug, Default)]
pub(crate) struct TagIndex {
    inner: RwLock<Maps>,
}

#[derive(Debug, Default)]
struct Maps {
    by_tag: HashMap<String, HashSet<String>>,
    by_key: HashMap<String, HashSet<String>>,
}

impl Maps {
    fn unlink(&mut self, key: &str) -> Option<HashSet<String>> {
        let tags = self.by_key.remove(key)?;
        for tag in &tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        Some(tags)
    }
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `key` carries exactly `tags`, replacing any earlier tags.
    pub fn register<I, T>(&self, key: &str, tags: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tags: HashSet<String> = tags.into_iter().map(Into::into).collect();
        let mut maps = self.inner.write();
        maps.unlink(key);
        if tags.is_empty() {
            return;
        }
        for tag in &tags {
            maps.by_tag.entry(tag.clone()).or_default().insert(key.to_owned());
        }
        maps.by_key.insert(key.to_owned(), tags);
    }

    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        let maps = self.inner.read();
        let mut keys: Vec<String> = maps.by_tag.get(tag).map(|keys| keys.iter().cloned().collect()).unwrap_or_default();
        keys.sort_unstable();
        keys
    }

    pub fn tags_for_key(&self, key: &str) -> Vec<String> {
        let maps = self.inner.read();
        let mut tags: Vec<String> = maps.by_key.get(key).map(|tags| tags.iter().cloned().collect()).unwrap_or_default();
        tags.sort_unstable();
        tags
    }

    /// Returns every tag matching `predicate`.
    pub fn tags_matching(&self, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        self.inner.read().by_tag.keys().filter(|tag| predicate(tag)).cloned().collect()
    }

    /// Returns every indexed key matching `predicate`.
    pub fn keys_matching(&self, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        self.inner.read().by_key.keys().filter(|key| predicate(key)).cloned().collect()
    }

    /// Removes `key` from every tag it carries.
    pub fn remove_key(&self, key: &str) -> bool {
        self.inner.write().unlink(key).is_some()
    }

    pub fn clear(&self) {
        let mut maps = self.inner.write();
        maps.by_tag.clear();
        maps.by_key.clear();
    }

    pub fn key_count(&self) -> usize {
        self.inner.read().by_key.len()
    }

    pub fn tag_count(&self) -> usize {
        self.inner.read().by_tag.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> TagIndex {
        let index = TagIndex::new();
        index.register("kpi:leads:1", ["kpi", "leads", "dealership_1"]);
        index.register("kpi:leads:2", ["kpi", "leads", "dealership_2"]);
        index.register("kpi:chat:1", ["kpi", "dealership_1"]);
        index
    }

    #[test]
    fn register_and_lookup() {
        let index = index();
        assert_eq!(index.keys_for_tag("dealership_1"), ["kpi:chat:1", "kpi:leads:1"]);
        assert_eq!(index.tags_for_key("kpi:leads:2"), ["dealership_2", "kpi", "leads"]);
        assert_eq!(index.key_count(), 3);
        assert_eq!(index.tag_count(), 4);
        assert!(index.keys_for_tag("missing").is_empty());
    }

    #[test]
    fn register_replaces_previous_tags() {
        let index = index();
        index.register("kpi:chat:1", ["kpi"]);

        assert_eq!(index.keys_for_tag("dealership_1"), ["kpi:leads:1"]);
        assert_eq!(index.tags_for_key("kpi:chat:1"), ["kpi"]);
    }

    #[test]
    fn register_without_tags_unlinks() {
        let index = index();
        index.register("kpi:chat:1", Vec::<String>::new());
        assert!(index.tags_for_key("kpi:chat:1").is_empty());
        assert_eq!(index.key_count(), 2);
    }

    #[test]
    fn remove_key_drops_empty_tags() {
        let index = index();
        assert!(index.remove_key("kpi:leads:2"));
        assert!(!index.remove_key("kpi:leads:2"));

        assert_eq!(index.tag_count(), 3);
        assert!(index.keys_for_tag("dealership_2").is_empty());
        assert_eq!(index.keys_for_tag("leads"), ["kpi:leads:1"]);
    }

    #[test]
    fn tag_disappears_with_its_last_key() {
        let index = index();
        index.remove_key("kpi:chat:1");
        assert_eq!(index.keys_for_tag("dealership_1"), ["kpi:leads:1"]);
        index.remove_key("kpi:leads:1");

        assert!(index.tags_matching(|tag| tag == "dealership_1").is_empty());
        assert_eq!(index.keys_for_tag("kpi"), ["kpi:leads:2"]);
        assert_eq!(index.tag_count(), 3);
    }

    #[test]
    fn matching_and_clear() {
        let index = index();
        let mut tags = index.tags_matching(|tag| tag.starts_with("dealership_"));
        tags.sort();
        assert_eq!(tags, ["dealership_1", "dealership_2"]);

        let mut keys = index.keys_matching(|key| key.starts_with("kpi:leads"));
        keys.sort();
        assert_eq!(keys, ["kpi:leads:1", "kpi:leads:2"]);

        index.clear();
        assert_eq!(index.key_count(), 0);
        assert_eq!(index.tag_count(), 0);
    }
}
