//! Optional shared L2 cache tier.
//!
//! Values are canonical-JSON [`CacheEnvelope`]s keyed by the same strings as
//! L1. Every L2 operation is allowed to fail: failures degrade the call to
//! L1-only behaviour and are logged at most once per minute.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::warn;

use crate::canonical::to_canonical_string;
use crate::error::{Error, Result};

use super::CacheEnvelope;

/// Minimal key-value interface the L2 tier is built on.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Redis-backed store shared across processes.
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to the given redis URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| Error::CacheL2Down(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::CacheL2Down(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .map_err(|e| Error::CacheL2Down(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds)
            .await
            .map_err(|e| Error::CacheL2Down(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| Error::CacheL2Down(e.to_string()))?;
        Ok(removed > 0)
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<std::collections::HashMap<String, (String, i64)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= now => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let expires_at = Utc::now().timestamp() + ttl_seconds as i64;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }
}

const WARN_INTERVAL_SECS: i64 = 60;

/// L2 tier wrapper: optional store plus degradation bookkeeping.
pub struct L2Tier {
    store: Option<Arc<dyn KvStore>>,
    last_warn: AtomicI64,
}

impl L2Tier {
    pub fn new(store: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            store,
            last_warn: AtomicI64::new(0),
        }
    }

    /// A tier with no backing store; every operation is a no-op.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    fn warn_throttled(&self, op: &str, err: &Error) {
        let now = Utc::now().timestamp();
        let last = self.last_warn.load(Ordering::Relaxed);
        if now - last >= WARN_INTERVAL_SECS
            && self
                .last_warn
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(op, error = %err, "L2 cache degraded to L1-only");
        }
    }

    /// Fetch and decode an envelope. Failures and decode errors read as misses.
    pub async fn get(&self, key: &str) -> Option<CacheEnvelope> {
        let store = self.store.as_ref()?;
        match store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(envelope) => Some(envelope),
                Err(err) => {
                    warn!(key, error = %err, "dropping undecodable L2 entry");
                    let _ = store.delete(key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                self.warn_throttled("get", &err);
                None
            }
        }
    }

    /// Store an envelope with the given TTL. Failure is non-fatal.
    pub async fn set(&self, key: &str, envelope: &CacheEnvelope, ttl_seconds: u64) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let raw = match to_canonical_string(envelope) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key, error = %err, "failed to encode L2 envelope");
                return;
            }
        };
        if let Err(err) = store.set(key, &raw, ttl_seconds).await {
            self.warn_throttled("set", &err);
        }
    }

    /// Delete a key. Failure is non-fatal and reads as not-present.
    pub async fn delete(&self, key: &str) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match store.delete(key).await {
            Ok(removed) => removed,
            Err(err) => {
                self.warn_throttled("delete", &err);
                false
            }
        }
    }

    /// Liveness probe: set/get/delete round-trip, returning latency in ms.
    pub async fn ping(&self) -> Result<u64> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::CacheL2Down("L2 disabled".to_string()))?;
        let key = format!("ping:{}", uuid::Uuid::new_v4());
        let started = Instant::now();
        store.set(&key, "1", 30).await?;
        let read = store.get(&key).await?;
        store.delete(&key).await?;
        if read.as_deref() != Some("1") {
            return Err(Error::CacheL2Down("ping read-back mismatch".to_string()));
        }
        Ok(started.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingStore;

    #[async_trait]
    impl KvStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::CacheL2Down("down".to_string()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: u64) -> Result<()> {
            Err(Error::CacheL2Down("down".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(Error::CacheL2Down("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let tier = L2Tier::new(Some(Arc::new(MemoryKvStore::new())));
        let envelope = CacheEnvelope::new(json!({"a": 1}));

        tier.set("k", &envelope, 60).await;
        assert_eq!(tier.get("k").await, Some(envelope));
        assert!(tier.delete("k").await);
        assert_eq!(tier.get("k").await, None);
    }

    #[tokio::test]
    async fn test_expired_memory_entries_read_as_miss() {
        let store = MemoryKvStore::new();
        store.set("k", "v", 0).await.unwrap();
        // ttl of zero expires immediately
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failures_degrade_silently() {
        let tier = L2Tier::new(Some(Arc::new(FailingStore)));
        let envelope = CacheEnvelope::new(json!(1));

        tier.set("k", &envelope, 60).await;
        assert_eq!(tier.get("k").await, None);
        assert!(!tier.delete("k").await);
        assert!(tier.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_tier_is_inert() {
        let tier = L2Tier::disabled();
        assert!(!tier.is_enabled());
        assert_eq!(tier.get("k").await, None);
        assert!(tier.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let tier = L2Tier::new(Some(Arc::new(MemoryKvStore::new())));
        let latency = tier.ping().await.unwrap();
        assert!(latency < 1000);
    }
}
