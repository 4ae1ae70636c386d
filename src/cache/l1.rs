//! In-process L1 cache: sharded LRU with per-entry TTL.
//!
//! The size bound is in entries, not bytes. Reads and writes take the shard
//! mutex only; no await happens under a lock.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use super::CacheEnvelope;

const SHARD_COUNT: usize = 16;

struct L1Entry {
    envelope: CacheEnvelope,
    expires_at: Instant,
}

/// Sharded LRU + TTL cache holding [`CacheEnvelope`] values.
pub struct L1Cache {
    shards: Vec<Mutex<LruCache<String, L1Entry>>>,
}

impl L1Cache {
    /// Create a cache bounded to roughly `max_entries` across all shards.
    pub fn new(max_entries: usize) -> Self {
        let per_shard =
            NonZeroUsize::new((max_entries / SHARD_COUNT).max(1)).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self { shards }
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, L1Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Look up a key, evicting it if its TTL has elapsed.
    pub fn get(&self, key: &str) -> Option<CacheEnvelope> {
        let mut shard = self.shard(key).lock().ok()?;
        match shard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.envelope.clone()),
            Some(_) => {
                shard.pop(key);
                None
            }
            None => None,
        }
    }

    /// Insert an envelope with the given TTL.
    pub fn insert(&self, key: &str, envelope: CacheEnvelope, ttl: Duration) {
        if let Ok(mut shard) = self.shard(key).lock() {
            shard.put(
                key.to_string(),
                L1Entry {
                    envelope,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    /// Remove a single key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.shard(key)
            .lock()
            .map(|mut shard| shard.pop(key).is_some())
            .unwrap_or(false)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for shard in &self.shards {
            if let Ok(mut shard) = shard.lock() {
                shard.clear();
            }
        }
    }

    /// Live entry count across shards (includes not-yet-evicted expired entries).
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|s| s.lock().ok().map(|s| s.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_get() {
        let cache = L1Cache::new(64);
        let envelope = CacheEnvelope::new(json!("hello"));
        cache.insert("k1", envelope.clone(), Duration::from_secs(60));

        assert_eq!(cache.get("k1"), Some(envelope));
        assert_eq!(cache.get("k2"), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = L1Cache::new(64);
        cache.insert("k1", CacheEnvelope::new(json!(1)), Duration::from_secs(0));
        assert_eq!(cache.get("k1"), None);
        // The expired entry was evicted on read
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = L1Cache::new(64);
        cache.insert("k1", CacheEnvelope::new(json!(1)), Duration::from_secs(60));
        cache.insert("k2", CacheEnvelope::new(json!(2)), Duration::from_secs(60));

        assert!(cache.remove("k1"));
        assert!(!cache.remove("k1"));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let cache = L1Cache::new(16);
        for i in 0..1000 {
            cache.insert(
                &format!("key-{i}"),
                CacheEnvelope::new(json!(i)),
                Duration::from_secs(60),
            );
        }
        // Per-shard LRU bound keeps the total near the configured cap
        assert!(cache.len() <= 16);
    }
}
