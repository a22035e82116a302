// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Redis store implementation.

use std::{fmt, marker::PhantomData, sync::Arc, time::SystemTime};

use kpicache_tier::{CacheEntry, Clock, EntryStore, KeyFilter, Result, StoreError};
use redis::{Client, RedisError, aio::ConnectionManager};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::OnceCell;

use crate::RedisConfig;

const NAME: &str = "redis";
const SCAN_BATCH: usize = 500;

// KEYS[1] entry key, KEYS[2..] tag sets.
// ARGV: payload, version, ttl ms, mode, expected version, logical key, tag key prefix.
// Tags the replaced entry carried but the new one does not are dropped. A tag
// set expires with the longest-lived entry written into it.
const WRITE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
local previous = nil
if current then previous = cjson.decode(current) end
if ARGV[4] == 'cas' then
  if not previous then return 0 end
  if previous['version'] ~= tonumber(ARGV[5]) then return 0 end
elseif previous then
  if previous['version'] > tonumber(ARGV[2]) then return 0 end
end
if previous then
  local kept = {}
  for i = 2, #KEYS do kept[KEYS[i]] = true end
  for _, tag in ipairs(previous['tags']) do
    local tag_key = ARGV[7] .. tag
    if not kept[tag_key] then redis.call('SREM', tag_key, ARGV[6]) end
  end
end
local ttl = tonumber(ARGV[3])
redis.call('SET', KEYS[1], ARGV[1], 'PX', ttl)
for i = 2, #KEYS do
  redis.call('SADD', KEYS[i], ARGV[6])
  if redis.call('PTTL', KEYS[i]) < ttl then
    redis.call('PEXPIRE', KEYS[i], ttl)
  end
end
return 1
";

// KEYS[1] entry key. ARGV: tag key prefix, logical key.
const INVALIDATE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current then
  for _, tag in ipairs(cjson.decode(current)['tags']) do
    redis.call('SREM', ARGV[1] .. tag, ARGV[2])
  end
  redis.call('DEL', KEYS[1])
end
return 1
";

// KEYS[1] tag set. ARGV: entry key prefix.
// Returns the members whose entry still exists and drops the rest.
const TAG_MEMBERS_SCRIPT: &str = r"
local live = {}
for _, key in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. key) == 1 then
    table.insert(live, key)
  else
    redis.call('SREM', KEYS[1], key)
  end
end
return live
";

/// A distributed store backed by Redis.
///
/// The connection is established lazily on first use and bounded by the
/// configured connect timeout. A failed attempt leaves the store unconnected,
/// so the next call (typically the service's reconnect probe) tries again.
/// Once connected, `ConnectionManager` re-establishes dropped connections on
/// its own.
///
/// Entries expire natively through `PX`, so [`EntryStore::evict_expired`] has
/// nothing to remove and [`EntryStore::len`] is not tracked. Tag sets carry an
/// expiry too, and members whose entry has expired are pruned whenever the tag
/// is listed.
///
/// # Examples
///
/// ```no_run
/// use kpicache_redis::{RedisConfig, RedisStore};
/// use kpicache_tier::EntryStore;
///
/// # async fn example() -> Result<(), kpicache_tier::StoreError> {
/// let store = RedisStore::<String>::new(&RedisConfig::new("redis://127.0.0.1:6379"))?;
/// store.ping().await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisStore<V> {
    client: Client,
    connection: Arc<OnceCell<ConnectionManager>>,
    config: RedisConfig,
    clock: Clock,
    _value: PhantomData<fn() -> V>,
}

impl<V> fmt::Debug for RedisStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.config.key_prefix)
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl<V> Clone for RedisStore<V> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            connection: Arc::clone(&self.connection),
            config: self.config.clone(),
            clock: self.clock.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> RedisStore<V> {
    /// Creates a store for the configured server without connecting.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| StoreError::operation(NAME, format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            connection: Arc::new(OnceCell::new()),
            config: config.clone(),
            clock: Clock::system(),
            _value: PhantomData,
        })
    }

    /// Uses `clock` to compute the remaining TTL of written entries.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn entry_key(&self, key: &str) -> String {
        format!("{}{key}", self.entry_prefix())
    }

    pub(crate) fn entry_prefix(&self) -> String {
        format!("{}entry:", self.config.key_prefix)
    }

    pub(crate) fn tag_prefix(&self) -> String {
        format!("{}tag:", self.config.key_prefix)
    }

    pub(crate) fn tag_key(&self, tag: &str) -> String {
        format!("{}{tag}", self.tag_prefix())
    }

    pub(crate) fn logical_key<'a>(&self, entry_key: &'a str) -> Option<&'a str> {
        entry_key.strip_prefix(&self.config.key_prefix)?.strip_prefix("entry:")
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let client = self.client.clone();
        let timeout = self.config.connect_timeout();
        let manager = self
            .connection
            .get_or_try_init(|| async move {
                match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
                    Ok(Ok(manager)) => {
                        tracing::info!(store = NAME, "connected to redis");
                        Ok(manager)
                    }
                    Ok(Err(e)) => Err(store_error(&e)),
                    Err(_) => Err(StoreError::unavailable(NAME, format!("connect timed out after {timeout:?}"))),
                }
            })
            .await?;
        Ok(manager.clone())
    }

    async fn scan_entries(&self, conn: &mut ConnectionManager) -> Result<Vec<String>> {
        let pattern = format!("{}*", self.entry_prefix());
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await
                .map_err(|e| store_error(&e))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn write(&self, key: &str, expected: Option<u64>, entry: &CacheEntry<V>) -> Result<bool>
    where
        V: Serialize,
    {
        let Some(ttl) = entry.remaining_ttl(self.clock.now()) else {
            return Ok(false);
        };
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let payload = serde_json::to_string(entry).map_err(|e| StoreError::serialization(NAME, e.to_string()))?;
        let tag_keys: Vec<String> = entry.tags().iter().map(|tag| self.tag_key(tag)).collect();
        let (mode, expected) = expected.map_or(("insert", 0), |v| ("cas", v));

        let mut conn = self.connection().await?;
        let written: i64 = redis::cmd("EVAL")
            .arg(WRITE_SCRIPT)
            .arg(1 + tag_keys.len())
            .arg(self.entry_key(key))
            .arg(&tag_keys)
            .arg(payload)
            .arg(entry.version())
            .arg(ttl_ms)
            .arg(mode)
            .arg(expected)
            .arg(key)
            .arg(self.tag_prefix())
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error(&e))?;
        Ok(written == 1)
    }
}

impl<V> EntryStore<V> for RedisStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        let mut conn = self.connection().await?;
        let data: Option<String> = redis::cmd("GET")
            .arg(self.entry_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error(&e))?;

        data.map(|payload| serde_json::from_str(&payload).map_err(|e| StoreError::serialization(NAME, e.to_string())))
            .transpose()
    }

    async fn insert(&self, key: &str, entry: CacheEntry<V>) -> Result<bool> {
        self.write(key, None, &entry).await
    }

    async fn compare_and_insert(&self, key: &str, expected: u64, entry: CacheEntry<V>) -> Result<bool> {
        self.write(key, Some(expected), &entry).await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("EVAL")
            .arg(INVALIDATE_SCRIPT)
            .arg(1)
            .arg(self.entry_key(key))
            .arg(self.tag_prefix())
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error(&e))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.config.key_prefix);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| store_error(&e))?;
            if !keys.is_empty() {
                let _: i64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| store_error(&e))?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn keys(&self, filter: &KeyFilter) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut keys: Vec<String> = match filter {
            KeyFilter::Tag(tag) => redis::cmd("EVAL")
                .arg(TAG_MEMBERS_SCRIPT)
                .arg(1)
                .arg(self.tag_key(tag))
                .arg(self.entry_prefix())
                .query_async(&mut conn)
                .await
                .map_err(|e| store_error(&e))?,
            KeyFilter::All | KeyFilter::Pattern(_) => self
                .scan_entries(&mut conn)
                .await?
                .iter()
                .filter_map(|entry_key| self.logical_key(entry_key))
                .filter(|key| filter.matches_key(key))
                .map(str::to_owned)
                .collect(),
        };
        keys.sort();
        Ok(keys)
    }

    async fn evict_expired(&self, _now: SystemTime) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| store_error(&e))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        NAME
    }
}

/// Classifies a Redis error; anything suggesting the server is unreachable becomes `Unavailable`.
pub(crate) fn store_error(error: &RedisError) -> StoreError {
    if error.is_connection_refusal() || error.is_connection_dropped() || error.is_io_error() || error.is_timeout() {
        StoreError::unavailable(NAME, error.to_string())
    } else {
        StoreError::operation(NAME, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use kpicache_tier::StoreErrorKind;
    use redis::ErrorKind;

    use super::*;

    fn store() -> RedisStore<i32> {
        let config = RedisConfig {
            key_prefix: "kpi:".to_owned(),
            ..RedisConfig::default()
        };
        RedisStore::new(&config).unwrap()
    }

    #[test]
    fn key_layout() {
        let store = store();
        assert_eq!(store.entry_key("conv:1"), "kpi:entry:conv:1");
        assert_eq!(store.entry_prefix(), "kpi:entry:");
        assert_eq!(store.tag_key("dealership_1"), "kpi:tag:dealership_1");
        assert_eq!(store.logical_key("kpi:entry:conv:1"), Some("conv:1"));
        assert_eq!(store.logical_key("kpi:tag:dealership_1"), None);
        assert_eq!(store.logical_key("other:entry:conv:1"), None);
    }

    #[test]
    fn io_errors_are_unavailable() {
        let refused = RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(store_error(&refused).kind(), StoreErrorKind::Unavailable);

        let reset = RedisError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(store_error(&reset).kind(), StoreErrorKind::Unavailable);
    }

    #[test]
    fn command_errors_are_operation_failures() {
        let wrong_type = RedisError::from((ErrorKind::TypeError, "unexpected reply"));
        let error = store_error(&wrong_type);
        assert_eq!(error.kind(), StoreErrorKind::Operation);
        assert_eq!(error.store(), "redis");
    }

    #[test]
    fn invalid_url_is_rejected() {
        let config = RedisConfig::new("not a url");
        let error = RedisStore::<i32>::new(&config).unwrap_err();
        assert_eq!(error.kind(), StoreErrorKind::Operation);
    }

    #[tokio::test]
    async fn expired_entries_are_not_written() {
        let store = store();
        let entry = CacheEntry::new(1, SystemTime::UNIX_EPOCH, kpicache_tier::ExpiryPolicy::default());
        assert!(!store.insert("old", entry).await.unwrap());
    }
}
