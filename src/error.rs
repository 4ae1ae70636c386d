//! Error types for loggy-core.

use thiserror::Error;

/// Result type alias using loggy-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the analysis pipeline.
///
/// Each variant carries a stable kind string (see [`Error::kind`]) that is
/// surfaced to clients as `"<KIND>: <message>"` in terminal `error` events.
#[derive(Error, Debug)]
pub enum Error {
    /// Parameter extraction could not produce schema-valid output after retries
    #[error("parameter extraction failed: {0}")]
    ParamExtraction(String),

    /// Planning returned malformed output
    #[error("planning failed: {0}")]
    PlanFailed(String),

    /// Log backend refused, timed out, or errored after retries
    #[error("log backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Raw payload exceeded the configured byte cap
    #[error("input too large: {got} bytes exceeds cap of {cap}")]
    InputTooLarge { got: u64, cap: u64 },

    /// An LLM call exceeded its step budget
    #[error("LLM call timed out after {duration_ms}ms")]
    LlmTimeout { duration_ms: u64 },

    /// Repeated failures to parse a structured LLM response
    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    /// Shared cache tier unreachable. Never fatal; logged and degraded.
    #[error("L2 cache unavailable: {0}")]
    CacheL2Down(String),

    /// Config store could neither read nor fall back
    #[error("database unavailable: {0}")]
    DbUnavailable(String),

    /// A pipeline step exceeded its wall-clock budget
    #[error("step {step} exceeded its {budget_secs}s budget")]
    StepTimeout { step: String, budget_secs: u64 },

    /// Client went away; surfaced internally, never emitted as an error event
    #[error("run cancelled")]
    Cancelled,

    /// Prompt template missing a declared variable
    #[error("template {template} missing variable {variable}")]
    TemplateVariable { template: String, variable: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for unexpected conditions
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kind string used in client-visible error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ParamExtraction(_) => "PARAM_EXTRACTION_FAILED",
            Self::PlanFailed(_) => "PLAN_FAILED",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::InputTooLarge { .. } => "INPUT_TOO_LARGE",
            Self::LlmTimeout { .. } => "LLM_TIMEOUT",
            Self::LlmParse(_) | Self::TemplateVariable { .. } => "LLM_PARSE_ERROR",
            Self::CacheL2Down(_) => "CACHE_L2_DOWN",
            Self::DbUnavailable(_) => "DB_UNAVAILABLE",
            Self::StepTimeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Serialization(_) | Self::Config(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this failure aborts a pipeline run.
    ///
    /// Non-fatal failures (L2 cache trouble) are recorded on the run and
    /// never produce an `error` event.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::CacheL2Down(_))
    }

    /// Render as the client-visible `"<KIND>: <message>"` form.
    pub fn client_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    /// Create a backend error from a transport failure.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendUnavailable(message.into())
    }

    /// Create a step-budget timeout error.
    pub fn step_timeout(step: impl Into<String>, budget_secs: u64) -> Self {
        Self::StepTimeout {
            step: step.into(),
            budget_secs,
        }
    }

    /// Create a template-variable error.
    pub fn template_variable(template: impl Into<String>, variable: impl Into<String>) -> Self {
        Self::TemplateVariable {
            template: template.into(),
            variable: variable.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(
            Error::ParamExtraction("bad json".into()).kind(),
            "PARAM_EXTRACTION_FAILED"
        );
        assert_eq!(
            Error::InputTooLarge { got: 10, cap: 5 }.kind(),
            "INPUT_TOO_LARGE"
        );
        assert_eq!(Error::step_timeout("SEARCH", 60).kind(), "TIMEOUT");
        assert_eq!(Error::Cancelled.kind(), "CANCELLED");
        assert_eq!(Error::Internal("boom".into()).kind(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_l2_failures_are_not_fatal() {
        assert!(!Error::CacheL2Down("connection refused".into()).is_fatal());
        assert!(Error::DbUnavailable("no such table".into()).is_fatal());
    }

    #[test]
    fn test_client_message_prefixes_kind() {
        let err = Error::backend("connect timeout");
        assert!(err.client_message().starts_with("BACKEND_UNAVAILABLE: "));
    }
}
