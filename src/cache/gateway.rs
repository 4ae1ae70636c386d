//! LLM cache gateway: deterministic keying, two-tier lookup, single-flight
//! stampede protection, and per-request policy.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{CacheMode, LlmCacheConfig};
use crate::error::{Error, Result};

use super::key::{llm_cache_key, KeyMaterial};
use super::l1::L1Cache;
use super::l2::L2Tier;
use super::singleflight::{Flight, SingleFlight};
use super::CacheEnvelope;

/// Per-request cache behaviour overrides.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// When false the call behaves as if the cache were disabled
    pub enabled: bool,
    /// Opt-in required when the gateway runs in `default_off` mode
    pub use_cache: bool,
    /// Skip lookup; the result is still stored unless `no_store`
    pub no_cache: bool,
    /// Do not write the result to either tier
    pub no_store: bool,
    /// Per-call write TTL override
    pub ttl_seconds: Option<u64>,
    /// Reject cached values older than this many seconds
    pub s_maxage_seconds: Option<u64>,
    /// Overrides the gateway default namespace in the key
    pub namespace: Option<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            use_cache: false,
            no_cache: false,
            no_store: false,
            ttl_seconds: None,
            s_maxage_seconds: None,
            namespace: None,
        }
    }
}

impl CachePolicy {
    /// Policy for parse-retry attempts: skip lookup so a bad cached value is
    /// never served again; a valid recomputation may still be stored.
    pub fn no_cache_retry() -> Self {
        Self {
            no_cache: true,
            ..Self::default()
        }
    }
}

/// Where a `cached` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    #[serde(rename = "HIT_L1")]
    HitL1,
    #[serde(rename = "HIT_L2")]
    HitL2,
    #[serde(rename = "MISS")]
    Miss,
    #[serde(rename = "COALESCED")]
    Coalesced,
    #[serde(rename = "BYPASS_DISABLED")]
    BypassDisabled,
    #[serde(rename = "BYPASS_DEFAULT_OFF")]
    BypassDefaultOff,
    #[serde(rename = "BYPASS_UNSUPPORTED_TYPE")]
    BypassUnsupportedType,
}

/// Diagnostics returned with every `cached` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDiagnostics {
    pub status: CacheStatus,
    /// Tier that satisfied the read, when one did
    pub layer: Option<&'static str>,
    pub key: Option<String>,
    /// `llm:<cache_type>:` portion, useful for dashboards
    pub key_prefix: Option<String>,
    /// TTL applied on write, when a write happened
    pub ttl_seconds: Option<u64>,
    /// Whether this caller waited on another caller's computation
    pub waited: bool,
}

impl CacheDiagnostics {
    fn bypass(status: CacheStatus) -> Self {
        Self {
            status,
            layer: None,
            key: None,
            key_prefix: None,
            ttl_seconds: None,
            waited: false,
        }
    }
}

/// Result of a compute closure.
#[derive(Debug, Clone)]
pub struct ComputeOutcome {
    pub value: Value,
    /// Only cacheable results are written to the tiers
    pub cacheable: bool,
}

impl ComputeOutcome {
    pub fn cacheable(value: Value) -> Self {
        Self {
            value,
            cacheable: true,
        }
    }

    pub fn uncacheable(value: Value) -> Self {
        Self {
            value,
            cacheable: false,
        }
    }
}

#[derive(Default)]
struct GatewayStats {
    hit_l1: AtomicU64,
    hit_l2: AtomicU64,
    miss: AtomicU64,
    coalesced: AtomicU64,
    bypass: AtomicU64,
}

/// Serializable snapshot for the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatsSnapshot {
    pub hit_l1: u64,
    pub hit_l2: u64,
    pub miss: u64,
    pub coalesced: u64,
    pub bypass: u64,
    pub l1_entries: usize,
    pub l2_enabled: bool,
    pub mode: String,
    pub namespace: String,
    pub gateway_version: String,
    pub prompt_version: String,
}

/// Two-tier caching gateway in front of the LLM provider.
pub struct LlmCacheGateway {
    config: LlmCacheConfig,
    l1: L1Cache,
    l2: L2Tier,
    flights: SingleFlight<Value>,
    stats: GatewayStats,
    last_key: Mutex<Option<String>>,
}

impl LlmCacheGateway {
    pub fn new(config: LlmCacheConfig, l2: L2Tier) -> Self {
        let l1 = L1Cache::new(config.l1_max_entries);
        Self {
            config,
            l1,
            l2,
            flights: SingleFlight::new(),
            stats: GatewayStats::default(),
            last_key: Mutex::new(None),
        }
    }

    /// Serve `cache_type`/`model`/`messages`/`options` from cache, or run
    /// `compute` exactly once per key across concurrent callers.
    pub async fn cached<F>(
        &self,
        cache_type: &str,
        model: &str,
        messages: Value,
        options: Value,
        default_ttl: u64,
        policy: &CachePolicy,
        compute: F,
    ) -> Result<(Value, CacheDiagnostics)>
    where
        F: Future<Output = Result<ComputeOutcome>> + Send,
    {
        if !self.config.enabled || !policy.enabled {
            self.stats.bypass.fetch_add(1, Ordering::Relaxed);
            let outcome = compute.await?;
            return Ok((
                outcome.value,
                CacheDiagnostics::bypass(CacheStatus::BypassDisabled),
            ));
        }

        if !self
            .config
            .supported_call_types
            .iter()
            .any(|t| t == cache_type)
        {
            self.stats.bypass.fetch_add(1, Ordering::Relaxed);
            let outcome = compute.await?;
            return Ok((
                outcome.value,
                CacheDiagnostics::bypass(CacheStatus::BypassUnsupportedType),
            ));
        }

        if self.config.mode == CacheMode::DefaultOff && !policy.use_cache {
            self.stats.bypass.fetch_add(1, Ordering::Relaxed);
            let outcome = compute.await?;
            return Ok((
                outcome.value,
                CacheDiagnostics::bypass(CacheStatus::BypassDefaultOff),
            ));
        }

        let namespace = policy
            .namespace
            .as_deref()
            .unwrap_or(&self.config.namespace);
        let key = llm_cache_key(&KeyMaterial {
            gateway_version: &self.config.gateway_version,
            prompt_version: &self.config.prompt_version,
            namespace,
            cache_type,
            model,
            messages: &messages,
            options: &options,
        });
        let key_prefix = format!("llm:{cache_type}:");
        self.record_last_key(&key);

        let effective_ttl = policy.ttl_seconds.unwrap_or(default_ttl);

        if !policy.no_cache {
            if let Some(envelope) = self.l1.get(&key) {
                if !envelope.is_stale(policy.s_maxage_seconds) {
                    self.stats.hit_l1.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "LLM cache hit (l1)");
                    return Ok((
                        envelope.value,
                        CacheDiagnostics {
                            status: CacheStatus::HitL1,
                            layer: Some("l1"),
                            key: Some(key),
                            key_prefix: Some(key_prefix),
                            ttl_seconds: None,
                            waited: false,
                        },
                    ));
                }
            }

            if let Some(envelope) = self.l2.get(&key).await {
                if !envelope.is_stale(policy.s_maxage_seconds) {
                    self.stats.hit_l2.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "LLM cache hit (l2), promoting to l1");
                    self.l1.insert(
                        &key,
                        envelope.clone(),
                        Duration::from_secs(effective_ttl.min(self.config.l1_ttl_seconds)),
                    );
                    return Ok((
                        envelope.value,
                        CacheDiagnostics {
                            status: CacheStatus::HitL2,
                            layer: Some("l2"),
                            key: Some(key),
                            key_prefix: Some(key_prefix),
                            ttl_seconds: None,
                            waited: false,
                        },
                    ));
                }
            }
        }

        if policy.no_cache {
            // Lookup skipped by policy: compute directly, no coalescing.
            let outcome = compute.await?;
            let stored = self.maybe_store(&key, &outcome, policy, effective_ttl).await;
            self.stats.miss.fetch_add(1, Ordering::Relaxed);
            return Ok((
                outcome.value,
                CacheDiagnostics {
                    status: CacheStatus::Miss,
                    layer: None,
                    key: Some(key),
                    key_prefix: Some(key_prefix),
                    ttl_seconds: stored.then_some(effective_ttl),
                    waited: false,
                },
            ));
        }

        match self.flights.join(&key).await {
            Flight::Leader(guard) => {
                // A dropped leader closes the flight and the waiters
                // re-elect, so the computation can run inline here.
                match compute.await {
                    Ok(outcome) => {
                        let stored = self.maybe_store(&key, &outcome, policy, effective_ttl).await;
                        guard.complete(Ok(outcome.value.clone()));
                        self.stats.miss.fetch_add(1, Ordering::Relaxed);
                        Ok((
                            outcome.value,
                            CacheDiagnostics {
                                status: CacheStatus::Miss,
                                layer: None,
                                key: Some(key),
                                key_prefix: Some(key_prefix),
                                ttl_seconds: stored.then_some(effective_ttl),
                                waited: false,
                            },
                        ))
                    }
                    Err(err) => {
                        guard.complete(Err(err.client_message()));
                        Err(err)
                    }
                }
            }
            Flight::Waited(result) => {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                match result {
                    Ok(value) => Ok((
                        value,
                        CacheDiagnostics {
                            status: CacheStatus::Coalesced,
                            layer: None,
                            key: Some(key),
                            key_prefix: Some(key_prefix),
                            ttl_seconds: None,
                            waited: true,
                        },
                    )),
                    Err(message) => Err(Error::Internal(format!(
                        "coalesced computation failed: {message}"
                    ))),
                }
            }
        }
    }

    async fn maybe_store(
        &self,
        key: &str,
        outcome: &ComputeOutcome,
        policy: &CachePolicy,
        effective_ttl: u64,
    ) -> bool {
        if !outcome.cacheable || policy.no_store {
            return false;
        }
        let envelope = CacheEnvelope::new(outcome.value.clone());
        self.l1.insert(
            key,
            envelope.clone(),
            Duration::from_secs(effective_ttl.min(self.config.l1_ttl_seconds)),
        );
        self.l2.set(key, &envelope, effective_ttl).await;
        true
    }

    fn record_last_key(&self, key: &str) {
        if let Ok(mut last) = self.last_key.lock() {
            *last = Some(key.to_string());
        }
    }

    /// Cache key of the most recent operation, for the response header.
    pub fn last_cache_key(&self) -> Option<String> {
        self.last_key.lock().ok().and_then(|k| k.clone())
    }

    /// Remove one key from both tiers.
    pub async fn delete(&self, key: &str) -> bool {
        let l1_removed = self.l1.remove(key);
        let l2_removed = self.l2.delete(key).await;
        l1_removed || l2_removed
    }

    /// Remove several keys; returns how many were present somewhere.
    pub async fn delete_many(&self, keys: &[String]) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Drop the entire in-process tier.
    pub fn clear_l1(&self) {
        self.l1.clear();
    }

    /// L2 liveness probe; latency in milliseconds.
    pub async fn ping_l2(&self) -> Result<u64> {
        self.l2.ping().await
    }

    /// Counters and configuration echo for the stats endpoint.
    pub fn stats(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            hit_l1: self.stats.hit_l1.load(Ordering::Relaxed),
            hit_l2: self.stats.hit_l2.load(Ordering::Relaxed),
            miss: self.stats.miss.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            bypass: self.stats.bypass.load(Ordering::Relaxed),
            l1_entries: self.l1.len(),
            l2_enabled: self.l2.is_enabled(),
            mode: match self.config.mode {
                CacheMode::DefaultOn => "default_on".to_string(),
                CacheMode::DefaultOff => "default_off".to_string(),
            },
            namespace: self.config.namespace.clone(),
            gateway_version: self.config.gateway_version.clone(),
            prompt_version: self.config.prompt_version.clone(),
        }
    }
}
