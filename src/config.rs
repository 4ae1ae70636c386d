//! Process-wide typed configuration.
//!
//! All tunables are read once at startup from the environment and carried
//! explicitly through `AppState`; nothing in the crate reads env vars after
//! this point. Malformed values fall back to the compiled-in default with a
//! warning rather than aborting startup.

use std::path::PathBuf;

use tracing::warn;

use crate::error::{Error, Result};

/// Which LLM provider backs the agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProviderKind {
    /// OpenAI-compatible endpoint on localhost (e.g. an Ollama sidecar)
    Local,
    /// Remote hosted endpoint with credentials
    Remote,
}

/// Cache participation mode for the LLM gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Cache unless the per-request policy forbids it
    DefaultOn,
    /// Bypass unless the per-request policy opts in with `use_cache`
    DefaultOff,
}

/// LLM gateway cache configuration.
#[derive(Debug, Clone)]
pub struct LlmCacheConfig {
    pub enabled: bool,
    pub mode: CacheMode,
    pub namespace: String,
    pub l1_max_entries: usize,
    pub l1_ttl_seconds: u64,
    pub l2_enabled: bool,
    pub l2_url: Option<String>,
    /// Non-empty allow-list of cacheable call types
    pub supported_call_types: Vec<String>,
    pub gateway_version: String,
    pub prompt_version: String,
}

impl Default for LlmCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CacheMode::DefaultOn,
            namespace: "loggy".to_string(),
            l1_max_entries: 2048,
            l1_ttl_seconds: 3600,
            l2_enabled: false,
            l2_url: None,
            supported_call_types: vec![
                "parameter_extraction".to_string(),
                "planning".to_string(),
                "trace_analysis".to_string(),
                "entry_analysis".to_string(),
                "quality_assessment".to_string(),
                "verification".to_string(),
            ],
            gateway_version: "v1".to_string(),
            prompt_version: "v1".to_string(),
        }
    }
}

/// Log-search cache configuration.
#[derive(Debug, Clone)]
pub struct LogCacheConfig {
    pub enabled: bool,
    /// TTL for general queries
    pub ttl_seconds: u64,
    /// TTL for queries scoped to a single trace id
    pub trace_ttl_seconds: u64,
    pub l2_url: Option<String>,
}

impl Default for LogCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 14_400,
            trace_ttl_seconds: 21_600,
            l2_url: None,
        }
    }
}

/// Feature flags gating DB-backed dynamic configuration.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub use_db_prompts: bool,
    pub use_db_settings: bool,
    pub use_db_projects: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            use_db_prompts: true,
            use_db_settings: true,
            use_db_projects: true,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite path (or `:memory:`) backing the config store
    pub database_url: String,
    pub database_schema: Option<String>,
    /// Directory analysis artifacts are written beneath
    pub analysis_dir: PathBuf,

    pub llm_provider: LlmProviderKind,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,

    /// Remote log-aggregation endpoint and credential
    pub log_backend_url: Option<String>,
    pub log_backend_token: Option<String>,

    pub llm_cache: LlmCacheConfig,
    pub log_cache: LogCacheConfig,
    pub flags: FeatureFlags,

    /// Safety cap on bytes read from any log source per run
    pub max_log_bytes: u64,
    /// Absolute session lifetime
    pub session_timeout_seconds: u64,
    /// Cap on messages carried into any one LLM call
    pub max_context_messages: usize,

    /// Bind address for the server binary
    pub bind_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "loggy.db".to_string(),
            database_schema: None,
            analysis_dir: PathBuf::from("analysis"),
            llm_provider: LlmProviderKind::Local,
            llm_base_url: None,
            llm_model: None,
            llm_api_key: None,
            log_backend_url: None,
            log_backend_token: None,
            llm_cache: LlmCacheConfig::default(),
            log_cache: LogCacheConfig::default(),
            flags: FeatureFlags::default(),
            max_log_bytes: 50 * 1024 * 1024,
            session_timeout_seconds: 1800,
            max_context_messages: 40,
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable env value, using default");
                default
            }
        },
        None => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key).as_deref() {
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => true,
        Some("0") | Some("false") | Some("FALSE") | Some("no") => false,
        Some(other) => {
            warn!(key, value = other, "unparseable boolean env value, using default");
            default
        }
        None => default,
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let cache_defaults = LlmCacheConfig::default();
        let log_defaults = LogCacheConfig::default();

        let mode = match env_string("LLM_CACHE_MODE").as_deref() {
            Some("default_off") => CacheMode::DefaultOff,
            Some("default_on") | None => CacheMode::DefaultOn,
            Some(other) => {
                return Err(Error::Config(format!("unknown LLM_CACHE_MODE: {other}")));
            }
        };

        let provider = match env_string("LLM_PROVIDER").as_deref() {
            Some("remote") => LlmProviderKind::Remote,
            Some("local") | None => LlmProviderKind::Local,
            Some(other) => {
                return Err(Error::Config(format!("unknown LLM_PROVIDER: {other}")));
            }
        };

        let supported_call_types = env_string("LLM_CACHE_SUPPORTED_CALL_TYPES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(cache_defaults.supported_call_types);

        Ok(Self {
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            database_schema: env_string("DATABASE_SCHEMA"),
            analysis_dir: env_string("ANALYSIS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.analysis_dir),
            llm_provider: provider,
            llm_base_url: env_string("LLM_BASE_URL"),
            llm_model: env_string("LLM_MODEL"),
            llm_api_key: env_string("LLM_API_KEY"),
            log_backend_url: env_string("LOG_BACKEND_URL"),
            log_backend_token: env_string("LOG_BACKEND_TOKEN"),
            llm_cache: LlmCacheConfig {
                enabled: env_bool("LLM_CACHE_ENABLED", cache_defaults.enabled),
                mode,
                namespace: env_string("LLM_CACHE_NAMESPACE").unwrap_or(cache_defaults.namespace),
                l1_max_entries: env_parse(
                    "LLM_CACHE_L1_MAX_ENTRIES",
                    cache_defaults.l1_max_entries,
                ),
                l1_ttl_seconds: env_parse("LLM_CACHE_L1_TTL_SECONDS", cache_defaults.l1_ttl_seconds),
                l2_enabled: env_bool("LLM_CACHE_L2_ENABLED", cache_defaults.l2_enabled),
                l2_url: env_string("LLM_CACHE_L2_URL"),
                supported_call_types,
                gateway_version: env_string("LLM_GATEWAY_VERSION")
                    .unwrap_or(cache_defaults.gateway_version),
                prompt_version: env_string("PROMPT_VERSION").unwrap_or(cache_defaults.prompt_version),
            },
            log_cache: LogCacheConfig {
                enabled: env_bool("LOG_CACHE_ENABLED", log_defaults.enabled),
                ttl_seconds: env_parse("LOG_CACHE_TTL_SECONDS", log_defaults.ttl_seconds),
                trace_ttl_seconds: env_parse(
                    "LOG_CACHE_TRACE_TTL_SECONDS",
                    log_defaults.trace_ttl_seconds,
                ),
                l2_url: env_string("LOG_CACHE_L2_URL"),
            },
            flags: FeatureFlags {
                use_db_prompts: env_bool("USE_DB_PROMPTS", true),
                use_db_settings: env_bool("USE_DB_SETTINGS", true),
                use_db_projects: env_bool("USE_DB_PROJECTS", true),
            },
            max_log_bytes: env_parse("MAX_LOG_BYTES", defaults.max_log_bytes),
            session_timeout_seconds: env_parse(
                "SESSION_TIMEOUT_SECONDS",
                defaults.session_timeout_seconds,
            ),
            max_context_messages: env_parse("MAX_CONTEXT_MESSAGES", defaults.max_context_messages),
            bind_addr: env_string("BIND_ADDR").unwrap_or(defaults.bind_addr),
        })
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.llm_cache.l2_enabled && self.llm_cache.l2_url.is_none() {
            return Err(Error::Config(
                "LLM_CACHE_L2_ENABLED requires LLM_CACHE_L2_URL".to_string(),
            ));
        }
        if self.llm_cache.supported_call_types.is_empty() {
            return Err(Error::Config(
                "LLM_CACHE_SUPPORTED_CALL_TYPES must not be empty".to_string(),
            ));
        }
        if self.max_log_bytes == 0 {
            return Err(Error::Config("MAX_LOG_BYTES must be positive".to_string()));
        }
        Ok(())
    }
}
