//! Parameter extraction agent.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{call_typed, template, AgentContext};

const DEFAULT_ALLOWED_DOMAINS: [&str; 4] = ["transactions", "auth", "settlement", "onboarding"];
const DEFAULT_ALLOWED_KEYS: [&str; 8] = [
    "npsb",
    "beftn",
    "rtgs",
    "failed",
    "timeout",
    "reversal",
    "settlement",
    "duplicate",
];
const DEFAULT_EXCLUDED_KEYS: [&str; 3] = ["password", "pin", "otp"];

/// Structured search parameters extracted from the incident text.
///
/// Invariants enforced here regardless of what the model produced:
/// `domain` is in the allow-list or absent, `query_keys` is a unique
/// ordered subset of the allow-list minus the deny-list, and `time_frame`
/// is a single calendar date or absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub time_frame: Option<NaiveDate>,
    pub domain: Option<String>,
    pub query_keys: Vec<String>,
}

/// Raw model output before invariant enforcement.
#[derive(Debug, Serialize, Deserialize)]
struct RawParameters {
    #[serde(default)]
    time_frame: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    query_keys: Vec<String>,
}

/// Extracts structured search parameters from incident text.
pub struct ParameterAgent;

impl ParameterAgent {
    /// Run extraction and enforce the parameter invariants.
    pub async fn extract(ctx: &AgentContext, text: &str) -> Result<Parameters> {
        let allowed_domains = ctx
            .store
            .get_list("extraction", "allowed_domains", &DEFAULT_ALLOWED_DOMAINS)
            .await;
        let allowed_keys = ctx
            .store
            .get_list("extraction", "allowed_keys", &DEFAULT_ALLOWED_KEYS)
            .await;
        let excluded_keys = ctx
            .store
            .get_list("extraction", "excluded_keys", &DEFAULT_EXCLUDED_KEYS)
            .await;

        let record = ctx.store.get_prompt("parameter_extraction").await?;
        let mut values = HashMap::new();
        values.insert("text", text.to_string());
        values.insert("allowed_domains", allowed_domains.join(", "));
        values.insert("allowed_keys", allowed_keys.join(", "));
        values.insert("excluded_keys", excluded_keys.join(", "));
        let prompt = template::render(&record, &values)?;

        let raw: RawParameters = call_typed(ctx, "parameter_extraction", prompt, 0.0)
            .await
            .map_err(|err| match err {
                Error::LlmParse(message) => Error::ParamExtraction(message),
                other => other,
            })?;

        Ok(sanitize(raw, &allowed_domains, &allowed_keys, &excluded_keys))
    }
}

/// Enforce the invariants on raw model output.
fn sanitize(
    raw: RawParameters,
    allowed_domains: &[String],
    allowed_keys: &[String],
    excluded_keys: &[String],
) -> Parameters {
    let domain = raw
        .domain
        .map(|d| d.trim().to_lowercase())
        .filter(|d| allowed_domains.iter().any(|a| a == d));

    let excluded: HashSet<&str> = excluded_keys.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let query_keys = raw
        .query_keys
        .into_iter()
        .map(|k| to_snake_case(k.trim()))
        .filter(|k| allowed_keys.iter().any(|a| a == k))
        .filter(|k| !excluded.contains(k.as_str()))
        .filter(|k| seen.insert(k.clone()))
        .collect();

    Parameters {
        time_frame: raw.time_frame.as_deref().and_then(normalize_time_frame),
        domain,
        query_keys,
    }
}

/// Lowercase and join word boundaries with underscores.
fn to_snake_case(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut prev_lower = false;
    for c in token.chars() {
        if c.is_whitespace() || c == '-' {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        } else if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out.trim_matches('_').to_string()
}

/// A single `YYYY-MM-DD`; ranges normalise to their start day.
fn normalize_time_frame(raw: &str) -> Option<NaiveDate> {
    let pattern = Regex::new(r"\d{4}-\d{2}-\d{2}").ok()?;
    let first = pattern.find(raw)?;
    NaiveDate::parse_from_str(first.as_str(), "%Y-%m-%d").ok()
}
