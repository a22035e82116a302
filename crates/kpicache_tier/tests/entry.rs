// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for `CacheEntry` and `ExpiryPolicy`.

use std::time::{Duration, SystemTime};

use kpicache_tier::{CacheEntry, EntryState, ExpiryPolicy};

const T0: SystemTime = SystemTime::UNIX_EPOCH;

#[test]
fn new_entry_is_untagged_version_zero() {
    let entry = CacheEntry::new("value", T0, ExpiryPolicy::default());
    assert_eq!(*entry.value(), "value");
    assert_eq!(entry.version(), 0);
    assert!(entry.tags().is_empty());
    assert_eq!(entry.created_at(), T0);
}

#[test]
fn default_policy_is_five_minutes_at_eighty_percent() {
    let entry = CacheEntry::new((), T0, ExpiryPolicy::default());
    assert_eq!(entry.hard_expires_at(), T0 + Duration::from_secs(300));
    assert_eq!(entry.soft_expires_at(), T0 + Duration::from_secs(240));
}

#[test]
fn ratio_of_one_skips_stale_window() {
    let entry = CacheEntry::new(1, T0, ExpiryPolicy::new(Duration::from_secs(10), 1.0));
    assert_eq!(entry.state_at(T0 + Duration::from_millis(9_999)), EntryState::Fresh);
    assert_eq!(entry.state_at(T0 + Duration::from_secs(10)), EntryState::Expired);
}

#[test]
fn with_ttl_keeps_ratio() {
    let policy = ExpiryPolicy::new(Duration::from_secs(10), 0.5).with_ttl(Duration::from_secs(60));
    assert_eq!(policy.soft_ttl(), Duration::from_secs(30));
}

#[test]
fn tags_are_deduplicated() {
    let entry = CacheEntry::new(1, T0, ExpiryPolicy::default()).with_tags(["kpi", "kpi", "leads"]);
    assert_eq!(entry.tags().len(), 2);
    assert!(entry.has_tag("leads"));
}

#[test]
fn deref_and_into_value() {
    let entry = CacheEntry::new("owned".to_string(), T0, ExpiryPolicy::default());
    assert_eq!(entry.len(), 5);
    assert_eq!(entry.into_value(), "owned");
}

#[test]
fn state_names_are_stable() {
    assert_eq!(EntryState::Fresh.as_str(), "fresh");
    assert_eq!(EntryState::Stale.as_str(), "stale");
    assert_eq!(EntryState::Expired.as_str(), "expired");
}
