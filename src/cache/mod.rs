//! Two-tier caching for LLM calls and log-backend queries.
//!
//! Layout is shared between the two caches: an in-process sharded LRU with
//! per-entry TTL (L1) in front of an optional shared key-value store (L2).
//! The LLM gateway additionally provides single-flight stampede protection
//! and per-request policy; the log-search cache is a thin TTL-classed
//! wrapper over the same tiers.

mod gateway;
mod key;
mod l1;
mod l2;
mod log_cache;
mod singleflight;

pub use gateway::{
    CacheDiagnostics, CachePolicy, CacheStatus, ComputeOutcome, GatewayStatsSnapshot,
    LlmCacheGateway,
};
pub use key::{llm_cache_key, llm_fingerprint, KeyMaterial};
pub use l1::L1Cache;
pub use l2::{L2Tier, MemoryKvStore, KvStore, RedisStore};
pub use log_cache::LogSearchCache;
pub use singleflight::{Flight, SingleFlight};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope stored in both tiers.
///
/// L1 holds the struct directly; L2 holds its canonical-JSON serialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    /// Unix seconds at store time
    pub created_at: i64,
    pub value: Value,
}

impl CacheEnvelope {
    pub fn new(value: Value) -> Self {
        Self {
            created_at: Utc::now().timestamp(),
            value,
        }
    }

    /// Age in seconds relative to now; clamps negative clock skew to zero.
    pub fn age_seconds(&self) -> u64 {
        (Utc::now().timestamp() - self.created_at).max(0) as u64
    }

    /// Whether a staleness ceiling rejects this envelope.
    pub fn is_stale(&self, s_maxage_seconds: Option<u64>) -> bool {
        match s_maxage_seconds {
            Some(limit) => self.age_seconds() > limit,
            None => false,
        }
    }
}
