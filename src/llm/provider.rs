//! LLM provider trait and OpenAI-compatible client.
//!
//! Both deployment variants (a local sidecar and a remote hosted endpoint)
//! speak the `/v1/chat/completions` dialect; they differ only in base URL,
//! default model, and whether a bearer credential is attached.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, LlmProviderKind};
use crate::error::{Error, Result};

use super::types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage};

/// Provider interface the agents call through the cache gateway.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Default model identifier used when a request does not name one.
    fn default_model(&self) -> &str;
}

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub default_model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Cap on messages carried into one call; older history is dropped
    pub max_context_messages: usize,
}

impl ProviderConfig {
    const LOCAL_BASE_URL: &'static str = "http://127.0.0.1:11434";
    const LOCAL_MODEL: &'static str = "qwen2.5:14b";
    const REMOTE_MODEL: &'static str = "gpt-4o-mini";

    /// Derive from the application config.
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        match config.llm_provider {
            LlmProviderKind::Local => Ok(Self {
                base_url: config
                    .llm_base_url
                    .clone()
                    .unwrap_or_else(|| Self::LOCAL_BASE_URL.to_string()),
                default_model: config
                    .llm_model
                    .clone()
                    .unwrap_or_else(|| Self::LOCAL_MODEL.to_string()),
                api_key: None,
                timeout_secs: 120,
                max_context_messages: config.max_context_messages,
            }),
            LlmProviderKind::Remote => {
                let base_url = config.llm_base_url.clone().ok_or_else(|| {
                    Error::Config("remote LLM provider requires LLM_BASE_URL".to_string())
                })?;
                Ok(Self {
                    base_url,
                    default_model: config
                        .llm_model
                        .clone()
                        .unwrap_or_else(|| Self::REMOTE_MODEL.to_string()),
                    api_key: config.llm_api_key.clone(),
                    timeout_secs: 120,
                    max_context_messages: config.max_context_messages,
                })
            }
        }
    }
}

// OpenAI-compatible wire types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Client for any OpenAI-compatible chat endpoint.
pub struct OpenAiCompatClient {
    config: ProviderConfig,
    http: Client,
}

impl OpenAiCompatClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .as_deref()
            .unwrap_or(&self.config.default_model);

        // Keep the newest messages when the context cap is exceeded.
        let cap = self.config.max_context_messages.max(1);
        let start = request.messages.len().saturating_sub(cap);
        let messages = &request.messages[start..];

        let body = ChatCompletionRequest {
            model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Internal(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "LLM endpoint returned {status}: {detail}"
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::LlmParse(format!("malformed completion response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::LlmParse("completion response had no choices".to_string()))?;

        Ok(CompletionResponse {
            content,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            usage: parsed
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        })
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }
}

/// Build the provider selected by configuration.
pub fn build_provider(config: &AppConfig) -> Result<std::sync::Arc<dyn LlmProvider>> {
    let provider_config = ProviderConfig::from_app_config(config)?;
    Ok(std::sync::Arc::new(OpenAiCompatClient::new(
        provider_config,
    )?))
}

/// Scripted provider for tests: returns canned responses in order, then
/// repeats the last one.
#[cfg(test)]
pub struct ScriptedProvider {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    last: std::sync::Mutex<Option<String>>,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ScriptedProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
            last: std::sync::Mutex::new(None),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        let content = match responses.pop_front() {
            Some(content) => {
                *self.last.lock().unwrap() = Some(content.clone());
                content
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "{}".to_string()),
        };
        Ok(CompletionResponse {
            content,
            model: request.model.unwrap_or_else(|| "scripted".to_string()),
            usage: TokenUsage::default(),
        })
    }

    fn default_model(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;

    #[test]
    fn test_local_provider_defaults() {
        let app = AppConfig::default();
        let config = ProviderConfig::from_app_config(&app).unwrap();
        assert_eq!(config.base_url, ProviderConfig::LOCAL_BASE_URL);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_remote_provider_requires_base_url() {
        let mut app = AppConfig::default();
        app.llm_provider = LlmProviderKind::Remote;
        assert!(ProviderConfig::from_app_config(&app).is_err());

        app.llm_base_url = Some("https://api.example.com".to_string());
        let config = ProviderConfig::from_app_config(&app).unwrap();
        assert_eq!(config.base_url, "https://api.example.com");
    }

    #[tokio::test]
    async fn test_context_cap_keeps_newest_messages() {
        use serde_json::json;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, Request, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(move |request: &Request| {
                let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
                let messages = body["messages"].as_array().unwrap();
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[1]["content"], "newest");
                ResponseTemplate::new(200).set_body_json(json!({
                    "model": "m",
                    "choices": [{"message": {"content": "ok"}}],
                    "usage": {"prompt_tokens": 1, "completion_tokens": 1}
                }))
            })
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(ProviderConfig {
            base_url: server.uri(),
            default_model: "m".to_string(),
            api_key: None,
            timeout_secs: 5,
            max_context_messages: 2,
        })
        .unwrap();
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::user("old"),
                ChatMessage::user("mid"),
                ChatMessage::user("newest"),
            ],
            ..Default::default()
        };
        assert_eq!(client.complete(request).await.unwrap().content, "ok");
    }

    #[tokio::test]
    async fn test_scripted_provider_sequences() {
        let provider = ScriptedProvider::new(vec!["one".to_string(), "two".to_string()]);
        let request = CompletionRequest {
            messages: vec![ChatMessage::user("x")],
            ..Default::default()
        };

        assert_eq!(
            provider.complete(request.clone()).await.unwrap().content,
            "one"
        );
        assert_eq!(
            provider.complete(request.clone()).await.unwrap().content,
            "two"
        );
        // Exhausted scripts repeat the final response.
        assert_eq!(provider.complete(request).await.unwrap().content, "two");
        assert_eq!(provider.call_count(), 3);
    }
}
