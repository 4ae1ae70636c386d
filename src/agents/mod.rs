//! Agents: thin typed wrappers over the LLM cache gateway.
//!
//! Each agent renders a configured template, calls the gateway, and decodes
//! the response as strict JSON against its declared shape. Validation runs
//! inside the gateway's compute closure so invalid outputs are never
//! cached; parse failures retry with `no_cache` so a bad cached value is
//! never served twice.

mod analyze;
mod parameter;
mod planning;
pub mod template;
mod verify;

pub use analyze::{AnalysisArtifact, AnalyzeAgent, Confidence, Recommendation, TraceAnalysis};
pub use parameter::{ParameterAgent, Parameters};
pub use planning::{Plan, PlanStep, PlanningAgent};
pub use verify::{TraceSummary, TraceVerdict, VerificationResult, VerifyAgent};

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::cache::{CachePolicy, ComputeOutcome, LlmCacheGateway};
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::store::ConfigStore;

/// Extra parse attempts issued with `no_cache=true`.
const PARSE_RETRIES: usize = 2;

/// Default TTL for cached agent responses.
const AGENT_CACHE_TTL_SECS: u64 = 3600;

/// Shared dependencies handed to every agent call.
#[derive(Clone)]
pub struct AgentContext {
    pub provider: Arc<dyn LlmProvider>,
    pub gateway: Arc<LlmCacheGateway>,
    pub store: Arc<ConfigStore>,
}

/// Pull the first JSON object or array out of an LLM response, tolerating
/// markdown fences and prose around it.
fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find(['{', '['])?;
    let open = trimmed.as_bytes()[start];
    let close = if open == b'{' { b'}' } else { b']' };
    let end = trimmed.bytes().rposition(|b| b == close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(trimmed.get(start..=end)?).ok()
}

const UNPARSED_MARKER: &str = "__unparsed";

/// One gateway-cached, schema-validated LLM call with parse retries.
///
/// `T`'s deserialization is the schema: responses that fail it are marked
/// uncacheable and retried up to [`PARSE_RETRIES`] more times.
pub(crate) async fn call_typed<T>(
    ctx: &AgentContext,
    cache_type: &str,
    prompt: String,
    temperature: f64,
) -> Result<T>
where
    T: DeserializeOwned + Serialize + Send + 'static,
{
    let model = ctx.provider.default_model().to_string();
    let options = json!({"temperature": temperature});
    let messages = vec![ChatMessage::user(prompt)];
    let messages_value = serde_json::to_value(&messages)?;

    let mut last_failure = String::new();
    for attempt in 0..=PARSE_RETRIES {
        let policy = if attempt == 0 {
            CachePolicy::default()
        } else {
            CachePolicy::no_cache_retry()
        };

        let provider = Arc::clone(&ctx.provider);
        let request = CompletionRequest {
            model: Some(model.clone()),
            messages: messages.clone(),
            temperature: Some(temperature),
            max_tokens: None,
        };
        let compute = async move {
            let response = provider.complete(request).await?;
            match extract_json(&response.content)
                .and_then(|value| serde_json::from_value::<T>(value).ok())
            {
                Some(decoded) => Ok(ComputeOutcome::cacheable(serde_json::to_value(decoded)?)),
                None => {
                    let mut marker = serde_json::Map::new();
                    marker.insert(
                        UNPARSED_MARKER.to_string(),
                        Value::String(response.content),
                    );
                    Ok(ComputeOutcome::uncacheable(Value::Object(marker)))
                }
            }
        };

        let (value, _diagnostics) = ctx
            .gateway
            .cached(
                cache_type,
                &model,
                messages_value.clone(),
                options.clone(),
                AGENT_CACHE_TTL_SECS,
                &policy,
                compute,
            )
            .await?;

        if let Some(raw) = value.get(UNPARSED_MARKER) {
            last_failure = raw.as_str().unwrap_or_default().chars().take(200).collect();
            warn!(cache_type, attempt, "unparseable LLM response, retrying without cache");
            continue;
        }

        match serde_json::from_value(value) {
            Ok(decoded) => return Ok(decoded),
            Err(err) => {
                // A previously cached value no longer matching the schema;
                // treat like a parse failure and retry uncached.
                last_failure = err.to_string();
                warn!(cache_type, attempt, error = %err, "cached value failed schema decode");
                continue;
            }
        }
    }

    Err(Error::LlmParse(format!(
        "{cache_type} response stayed unparseable after {} attempts: {last_failure}",
        PARSE_RETRIES + 1
    )))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted agent context shared by the agent and pipeline tests.

    use super::*;
    use crate::cache::L2Tier;
    use crate::config::LlmCacheConfig;
    use crate::llm::ScriptedProvider;

    pub(crate) fn context_with(responses: Vec<&str>) -> (AgentContext, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new(
            responses.into_iter().map(String::from).collect(),
        ));
        let ctx = AgentContext {
            provider: Arc::clone(&provider) as Arc<dyn LlmProvider>,
            gateway: Arc::new(LlmCacheGateway::new(
                LlmCacheConfig::default(),
                L2Tier::disabled(),
            )),
            store: Arc::new(ConfigStore::new(
                None,
                crate::config::FeatureFlags {
                    use_db_prompts: false,
                    use_db_settings: false,
                    use_db_projects: false,
                },
            )),
        };
        (ctx, provider)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::context_with;
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Shape {
        score: i64,
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": 1}\n```\nDone."),
            Some(json!({"a": 1}))
        );
        assert_eq!(extract_json("[1, 2]"), Some(json!([1, 2])));
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn test_call_typed_parses_first_attempt() {
        let (ctx, provider) = context_with(vec![r#"{"score": 88}"#]);
        let shape: Shape = call_typed(&ctx, "planning", "p".to_string(), 0.0)
            .await
            .unwrap();
        assert_eq!(shape, Shape { score: 88 });
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_parse_retries_with_no_cache() {
        let (ctx, provider) = context_with(vec![
            "not json at all",
            "still { broken",
            r#"{"score": 42}"#,
        ]);
        let shape: Shape = call_typed(&ctx, "planning", "p".to_string(), 0.0)
            .await
            .unwrap();
        assert_eq!(shape.score, 42);
        assert_eq!(provider.call_count(), 3);

        // The malformed attempts were never cached: a fresh identical call
        // hits the cache populated by the valid third attempt.
        let shape: Shape = call_typed(&ctx, "planning", "p".to_string(), 0.0)
            .await
            .unwrap();
        assert_eq!(shape.score, 42);
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_persistent_garbage_is_llm_parse_error() {
        let (ctx, provider) = context_with(vec!["garbage"]);
        let result: Result<Shape> = call_typed(&ctx, "planning", "p".to_string(), 0.0).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), "LLM_PARSE_ERROR");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_schema_mismatch_counts_as_parse_failure() {
        // Valid JSON, wrong shape: "score" is a string.
        let (ctx, _provider) =
            context_with(vec![r#"{"score": "high"}"#, r#"{"score": "high"}"#, r#"{"score": 7}"#]);
        let shape: Shape = call_typed(&ctx, "planning", "p".to_string(), 0.0)
            .await
            .unwrap();
        assert_eq!(shape.score, 7);
    }
}
