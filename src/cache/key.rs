//! Deterministic cache key derivation for LLM calls.
//!
//! The fingerprint is the hex SHA-256 of the canonical-JSON tuple
//! `(gateway_version, prompt_version, namespace, cache_type, model,
//! messages, options)`. Bumping either version string invalidates every
//! existing entry. The human-readable key is `llm:<cache_type>:<hex>`.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::canonical::canonicalize;

/// Everything that participates in the fingerprint.
#[derive(Debug, Clone)]
pub struct KeyMaterial<'a> {
    pub gateway_version: &'a str,
    pub prompt_version: &'a str,
    pub namespace: &'a str,
    pub cache_type: &'a str,
    pub model: &'a str,
    pub messages: &'a Value,
    pub options: &'a Value,
}

/// Hex-encoded SHA-256 fingerprint over the canonical tuple.
pub fn llm_fingerprint(material: &KeyMaterial<'_>) -> String {
    let tuple = json!([
        material.gateway_version,
        material.prompt_version,
        material.namespace,
        material.cache_type,
        material.model,
        material.messages,
        material.options,
    ]);
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(&tuple).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Full cache key for a call.
pub fn llm_cache_key(material: &KeyMaterial<'_>) -> String {
    format!(
        "llm:{}:{}",
        material.cache_type,
        llm_fingerprint(material)
    )
}
