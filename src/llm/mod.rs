//! LLM provider abstraction and concrete clients.

mod provider;
mod types;

pub use provider::{build_provider, LlmProvider, OpenAiCompatClient, ProviderConfig};
pub use types::{ChatMessage, ChatRole, CompletionRequest, CompletionResponse, TokenUsage};

#[cfg(test)]
pub use provider::ScriptedProvider;
