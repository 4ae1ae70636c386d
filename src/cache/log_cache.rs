//! Caching for expensive log-backend queries.
//!
//! Mirrors the LLM gateway's tier layout without the policy machinery.
//! Queries that target a single trace id age out on a longer TTL than
//! general searches, since a trace's lines are immutable once written.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::canonical::canonicalize;
use crate::config::LogCacheConfig;
use crate::error::Result;

use super::l1::L1Cache;
use super::l2::L2Tier;
use super::CacheEnvelope;

const L1_MAX_ENTRIES: usize = 512;

/// TTL class of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    /// Scoped to one trace id
    Trace,
    /// Everything else
    General,
}

/// Cache wrapping `LogBackend` query responses.
pub struct LogSearchCache {
    config: LogCacheConfig,
    l1: L1Cache,
    l2: L2Tier,
}

impl LogSearchCache {
    pub fn new(config: LogCacheConfig, l2: L2Tier) -> Self {
        Self {
            config,
            l1: L1Cache::new(L1_MAX_ENTRIES),
            l2,
        }
    }

    /// Classify params: a non-empty `trace_id` field marks a trace query.
    pub fn classify(params: &Value) -> QueryClass {
        match params.get("trace_id") {
            Some(Value::String(id)) if !id.is_empty() => QueryClass::Trace,
            _ => QueryClass::General,
        }
    }

    fn ttl_for(&self, class: QueryClass) -> u64 {
        match class {
            QueryClass::Trace => self.config.trace_ttl_seconds,
            QueryClass::General => self.config.ttl_seconds,
        }
    }

    /// Cache key over `(namespace, canonical params)`.
    pub fn key(namespace: &str, params: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b"\x00");
        hasher.update(canonicalize(params).as_bytes());
        format!("logs:{}:{:x}", namespace, hasher.finalize())
    }

    /// Serve the query from cache or run `fetch` and store its response.
    ///
    /// Returns the response and whether it was served from cache.
    pub async fn get_or_fetch<F>(
        &self,
        namespace: &str,
        params: &Value,
        fetch: F,
    ) -> Result<(Value, bool)>
    where
        F: Future<Output = Result<Value>>,
    {
        if !self.config.enabled {
            return Ok((fetch.await?, false));
        }

        let key = Self::key(namespace, params);
        let class = Self::classify(params);
        let ttl = self.ttl_for(class);

        if let Some(envelope) = self.l1.get(&key) {
            debug!(key, "log query cache hit (l1)");
            return Ok((envelope.value, true));
        }
        if let Some(envelope) = self.l2.get(&key).await {
            debug!(key, "log query cache hit (l2)");
            self.l1
                .insert(&key, envelope.clone(), Duration::from_secs(ttl));
            return Ok((envelope.value, true));
        }

        let response = fetch.await?;
        let envelope = CacheEnvelope::new(response.clone());
        self.l1.insert(&key, envelope.clone(), Duration::from_secs(ttl));
        self.l2.set(&key, &envelope, ttl).await;
        Ok((response, false))
    }

    /// Drop the in-process tier.
    pub fn clear_l1(&self) {
        self.l1.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cache() -> LogSearchCache {
        LogSearchCache::new(LogCacheConfig::default(), L2Tier::disabled())
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            LogSearchCache::classify(&json!({"trace_id": "abc12345"})),
            QueryClass::Trace
        );
        assert_eq!(
            LogSearchCache::classify(&json!({"trace_id": ""})),
            QueryClass::General
        );
        assert_eq!(
            LogSearchCache::classify(&json!({"keywords": ["npsb"]})),
            QueryClass::General
        );
    }

    #[test]
    fn test_key_is_stable_and_namespaced() {
        let params = json!({"keywords": ["a"], "date": "2024-07-01"});
        assert_eq!(
            LogSearchCache::key("prod", &params),
            LogSearchCache::key("prod", &params)
        );
        assert_ne!(
            LogSearchCache::key("prod", &params),
            LogSearchCache::key("uat", &params)
        );
    }

    #[tokio::test]
    async fn test_fetch_then_hit() {
        let cache = cache();
        let params = json!({"keywords": ["npsb"]});

        let (value, hit) = cache
            .get_or_fetch("prod", &params, async { Ok(json!(["line1", "line2"])) })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(value, json!(["line1", "line2"]));

        let (value, hit) = cache
            .get_or_fetch("prod", &params, async {
                panic!("must not refetch a cached query")
            })
            .await
            .unwrap();
        assert!(hit);
        assert_eq!(value, json!(["line1", "line2"]));
    }

    #[tokio::test]
    async fn test_disabled_cache_always_fetches() {
        let mut config = LogCacheConfig::default();
        config.enabled = false;
        let cache = LogSearchCache::new(config, L2Tier::disabled());
        let params = json!({});

        let (_, hit) = cache
            .get_or_fetch("prod", &params, async { Ok(json!(1)) })
            .await
            .unwrap();
        assert!(!hit);
        let (_, hit) = cache
            .get_or_fetch("prod", &params, async { Ok(json!(2)) })
            .await
            .unwrap();
        assert!(!hit);
    }

    #[tokio::test]
    async fn test_fetch_failure_not_cached() {
        let cache = cache();
        let params = json!({"keywords": ["x"]});

        let result = cache
            .get_or_fetch("prod", &params, async {
                Err(crate::error::Error::backend("refused"))
            })
            .await;
        assert!(result.is_err());

        let (value, hit) = cache
            .get_or_fetch("prod", &params, async { Ok(json!("ok")) })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(value, json!("ok"));
    }
}
