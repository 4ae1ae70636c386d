//! Dynamic configuration: database-backed prompts, settings, and project
//! routing with in-process TTL caches and compiled-in fallbacks.
//!
//! Reads go cache → database (when the matching feature flag is on) →
//! compiled-in default. Database trouble degrades to the defaults; only
//! when neither source can answer does an accessor fail.

pub mod defaults;
mod schema;
mod sqlite;

pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use sqlite::SqliteConfigStore;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;
use tracing::warn;

use crate::config::FeatureFlags;
use crate::error::{Error, Result};

/// Routing kind of a project's log source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSourceType {
    File,
    Remote,
}

impl LogSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Remote => "remote",
        }
    }

    /// Parse from a stored string; unknown values read as `file`, the
    /// conservative choice that never reaches out over the network.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "remote" => Self::Remote,
            _ => Self::File,
        }
    }
}

impl std::fmt::Display for LogSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A project routing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_code: String,
    pub project_name: String,
    pub source: LogSourceType,
}

/// Environment-specific backend parameters for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEnv {
    pub project_code: String,
    pub env: String,
    /// Remote backend namespace
    pub namespace: Option<String>,
    /// File backend base log path
    pub base_path: Option<PathBuf>,
}

/// A prompt template record: the active version of a named prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub name: String,
    pub version: i64,
    pub template: String,
    /// Declared placeholder names the template expects
    pub variables: Vec<String>,
}

/// A typed setting as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingRecord {
    pub category: String,
    pub key: String,
    pub value: String,
    /// One of `string`, `int`, `float`, `bool`, `json-list`
    pub value_type: String,
}

impl SettingRecord {
    fn decode_i64(&self) -> Option<i64> {
        (self.value_type == "int").then(|| self.value.parse().ok()).flatten()
    }

    fn decode_f64(&self) -> Option<f64> {
        (self.value_type == "float" || self.value_type == "int")
            .then(|| self.value.parse().ok())
            .flatten()
    }

    fn decode_bool(&self) -> Option<bool> {
        if self.value_type != "bool" {
            return None;
        }
        match self.value.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }

    fn decode_list(&self) -> Option<Vec<String>> {
        (self.value_type == "json-list")
            .then(|| serde_json::from_str(&self.value).ok())
            .flatten()
    }
}

/// A verification context rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRule {
    pub domain: String,
    pub rule: String,
    pub position: i64,
}

/// Cache buckets addressable by [`ConfigStore::invalidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBucket {
    Prompts,
    Settings,
    Projects,
    ContextRules,
}

struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: std::hash::Hash + Eq, V: Clone> TtlCache<K, V> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((inserted, value)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: K, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, (Instant::now(), value));
        }
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

const PROMPT_TTL: Duration = Duration::from_secs(300);
const SETTING_TTL: Duration = Duration::from_secs(600);
const PROJECT_TTL: Duration = Duration::from_secs(600);

/// Facade over the dynamic configuration sources.
pub struct ConfigStore {
    db: Option<Arc<SqliteConfigStore>>,
    flags: FeatureFlags,
    prompts: TtlCache<String, PromptRecord>,
    settings: TtlCache<String, HashMap<String, SettingRecord>>,
    projects: TtlCache<String, Project>,
    project_envs: TtlCache<(String, String), ProjectEnv>,
    context_rules: TtlCache<String, Vec<ContextRule>>,
}

impl ConfigStore {
    pub fn new(db: Option<Arc<SqliteConfigStore>>, flags: FeatureFlags) -> Self {
        Self {
            db,
            flags,
            prompts: TtlCache::new(PROMPT_TTL),
            settings: TtlCache::new(SETTING_TTL),
            projects: TtlCache::new(PROJECT_TTL),
            project_envs: TtlCache::new(PROJECT_TTL),
            context_rules: TtlCache::new(SETTING_TTL),
        }
    }

    /// An in-memory store with all flags on (for testing).
    pub fn in_memory() -> Result<Self> {
        let db = SqliteConfigStore::in_memory()?;
        Ok(Self::new(Some(Arc::new(db)), FeatureFlags::default()))
    }

    /// Direct database handle, for seeding and admin paths.
    pub fn database(&self) -> Option<&Arc<SqliteConfigStore>> {
        self.db.as_ref()
    }

    async fn db_read<T, F>(&self, read: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<SqliteConfigStore>) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(self.db.as_ref()?);
        match spawn_blocking(move || read(db)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                warn!(error = %err, "config store read failed, falling back to defaults");
                None
            }
            Err(err) => {
                warn!(error = %err, "config store read task failed");
                None
            }
        }
    }

    // ==================== Prompts ====================

    /// Active template for a named prompt, or the compiled-in fallback.
    pub async fn get_prompt(&self, name: &str) -> Result<PromptRecord> {
        if let Some(record) = self.prompts.get(&name.to_string()) {
            return Ok(record);
        }

        if self.flags.use_db_prompts {
            let name_owned = name.to_string();
            if let Some(Some(record)) = self
                .db_read(move |db| db.fetch_active_prompt(&name_owned))
                .await
            {
                self.prompts.insert(name.to_string(), record.clone());
                return Ok(record);
            }
        }

        defaults::fallback_prompt(name)
            .ok_or_else(|| Error::DbUnavailable(format!("no prompt named {name}")))
    }

    // ==================== Settings ====================

    async fn settings_category(&self, category: &str) -> HashMap<String, SettingRecord> {
        if let Some(records) = self.settings.get(&category.to_string()) {
            return records;
        }

        if !self.flags.use_db_settings {
            return HashMap::new();
        }

        let category_owned = category.to_string();
        let records = self
            .db_read(move |db| db.fetch_settings_category(&category_owned))
            .await
            .unwrap_or_default();

        // One read fills every sibling key in the category.
        let map: HashMap<String, SettingRecord> = records
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();
        self.settings.insert(category.to_string(), map.clone());
        map
    }

    /// Integer setting with a typed default.
    pub async fn get_i64(&self, category: &str, key: &str, default: i64) -> i64 {
        match self.settings_category(category).await.get(key) {
            Some(record) => record.decode_i64().unwrap_or_else(|| {
                warn!(category, key, value = %record.value, "undecodable int setting");
                default
            }),
            None => default,
        }
    }

    /// Float setting with a typed default.
    pub async fn get_f64(&self, category: &str, key: &str, default: f64) -> f64 {
        match self.settings_category(category).await.get(key) {
            Some(record) => record.decode_f64().unwrap_or_else(|| {
                warn!(category, key, value = %record.value, "undecodable float setting");
                default
            }),
            None => default,
        }
    }

    /// Boolean setting with a typed default.
    pub async fn get_bool(&self, category: &str, key: &str, default: bool) -> bool {
        match self.settings_category(category).await.get(key) {
            Some(record) => record.decode_bool().unwrap_or_else(|| {
                warn!(category, key, value = %record.value, "undecodable bool setting");
                default
            }),
            None => default,
        }
    }

    /// String setting with a typed default.
    pub async fn get_string(&self, category: &str, key: &str, default: &str) -> String {
        match self.settings_category(category).await.get(key) {
            Some(record) if record.value_type == "string" => record.value.clone(),
            Some(record) => {
                warn!(category, key, value = %record.value, "undecodable string setting");
                default.to_string()
            }
            None => default.to_string(),
        }
    }

    /// JSON-list setting with a typed default.
    pub async fn get_list(&self, category: &str, key: &str, default: &[&str]) -> Vec<String> {
        match self.settings_category(category).await.get(key) {
            Some(record) => record.decode_list().unwrap_or_else(|| {
                warn!(category, key, value = %record.value, "undecodable list setting");
                default.iter().map(|s| s.to_string()).collect()
            }),
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }

    // ==================== Projects ====================

    /// Project routing record, or the compiled-in default for built-ins.
    pub async fn get_project(&self, code: &str) -> Result<Project> {
        if let Some(project) = self.projects.get(&code.to_string()) {
            return Ok(project);
        }

        if self.flags.use_db_projects {
            let code_owned = code.to_string();
            if let Some(Some(project)) =
                self.db_read(move |db| db.fetch_project(&code_owned)).await
            {
                self.projects.insert(code.to_string(), project.clone());
                return Ok(project);
            }
        }

        defaults::builtin_project(code)
            .ok_or_else(|| Error::Internal(format!("unknown project code {code}")))
    }

    /// Environment parameters for a project, or the compiled-in default.
    pub async fn get_project_env(&self, code: &str, env: &str) -> Result<ProjectEnv> {
        let cache_key = (code.to_string(), env.to_string());
        if let Some(record) = self.project_envs.get(&cache_key) {
            return Ok(record);
        }

        if self.flags.use_db_projects {
            let code_owned = code.to_string();
            let env_owned = env.to_string();
            if let Some(Some(record)) = self
                .db_read(move |db| db.fetch_project_env(&code_owned, &env_owned))
                .await
            {
                self.project_envs.insert(cache_key, record.clone());
                return Ok(record);
            }
        }

        defaults::builtin_project_env(code, env)
            .ok_or_else(|| Error::Internal(format!("unknown project code {code}")))
    }

    /// Routing predicate: does this project read logs from files?
    pub async fn is_file_based(&self, code: &str) -> Result<bool> {
        Ok(self.get_project(code).await?.source == LogSourceType::File)
    }

    /// Routing predicate: does this project query a remote backend?
    pub async fn is_remote_based(&self, code: &str) -> Result<bool> {
        Ok(self.get_project(code).await?.source == LogSourceType::Remote)
    }

    // ==================== Context rules ====================

    /// Ordered verification rules for a domain. Missing domain reads as empty.
    pub async fn get_context_rules(&self, domain: &str) -> Vec<ContextRule> {
        if let Some(rules) = self.context_rules.get(&domain.to_string()) {
            return rules;
        }

        let domain_owned = domain.to_string();
        let rules = self
            .db_read(move |db| db.fetch_context_rules(&domain_owned))
            .await
            .unwrap_or_default();
        self.context_rules.insert(domain.to_string(), rules.clone());
        rules
    }

    // ==================== Invalidation ====================

    /// Clear the in-process cache for one bucket.
    pub fn invalidate(&self, bucket: CacheBucket) {
        match bucket {
            CacheBucket::Prompts => self.prompts.clear(),
            CacheBucket::Settings => self.settings.clear(),
            CacheBucket::Projects => {
                self.projects.clear();
                self.project_envs.clear();
            }
            CacheBucket::ContextRules => self.context_rules.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn flags_off() -> FeatureFlags {
        FeatureFlags {
            use_db_prompts: false,
            use_db_settings: false,
            use_db_projects: false,
        }
    }

    #[tokio::test]
    async fn test_prompt_falls_back_when_flag_off() {
        let store = ConfigStore::new(None, flags_off());
        let prompt = store.get_prompt("planning").await.unwrap();
        assert_eq!(prompt.version, 0);
        assert!(store.get_prompt("nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn test_db_prompt_overrides_fallback() {
        let store = ConfigStore::in_memory().unwrap();
        store
            .database()
            .unwrap()
            .upsert_prompt(&PromptRecord {
                name: "planning".to_string(),
                version: 3,
                template: "custom {parameters} {project_name} {log_source_type}".to_string(),
                variables: vec![
                    "parameters".to_string(),
                    "project_name".to_string(),
                    "log_source_type".to_string(),
                ],
            })
            .unwrap();

        let prompt = store.get_prompt("planning").await.unwrap();
        assert_eq!(prompt.version, 3);

        // Cached: a second read does not change the answer.
        let again = store.get_prompt("planning").await.unwrap();
        assert_eq!(again, prompt);
    }

    #[tokio::test]
    async fn test_settings_decode_and_default() {
        let store = ConfigStore::in_memory().unwrap();
        let db = store.database().unwrap();
        db.set_setting(&SettingRecord {
            category: "pipeline".to_string(),
            key: "analyze_concurrency".to_string(),
            value: "8".to_string(),
            value_type: "int".to_string(),
        })
        .unwrap();
        db.set_setting(&SettingRecord {
            category: "pipeline".to_string(),
            key: "broken".to_string(),
            value: "not-a-number".to_string(),
            value_type: "int".to_string(),
        })
        .unwrap();

        assert_eq!(store.get_i64("pipeline", "analyze_concurrency", 4).await, 8);
        // Malformed value decodes to the typed default.
        assert_eq!(store.get_i64("pipeline", "broken", 4).await, 4);
        // Absent key decodes to the typed default.
        assert_eq!(store.get_i64("pipeline", "missing", 4).await, 4);
    }

    #[tokio::test]
    async fn test_category_fill_populates_siblings() {
        let store = ConfigStore::in_memory().unwrap();
        let db = store.database().unwrap();
        for key in ["a", "b"] {
            db.set_setting(&SettingRecord {
                category: "search".to_string(),
                key: key.to_string(),
                value: "1".to_string(),
                value_type: "int".to_string(),
            })
            .unwrap();
        }

        assert_eq!(store.get_i64("search", "a", 0).await, 1);

        // Sibling was cached by the first read; a direct DB write is not
        // observed until the bucket is invalidated.
        db.set_setting(&SettingRecord {
            category: "search".to_string(),
            key: "b".to_string(),
            value: "2".to_string(),
            value_type: "int".to_string(),
        })
        .unwrap();
        assert_eq!(store.get_i64("search", "b", 0).await, 1);

        store.invalidate(CacheBucket::Settings);
        assert_eq!(store.get_i64("search", "b", 0).await, 2);
    }

    #[tokio::test]
    async fn test_list_setting() {
        let store = ConfigStore::in_memory().unwrap();
        store
            .database()
            .unwrap()
            .set_setting(&SettingRecord {
                category: "extraction".to_string(),
                key: "allowed_domains".to_string(),
                value: r#"["transactions", "auth"]"#.to_string(),
                value_type: "json-list".to_string(),
            })
            .unwrap();

        assert_eq!(
            store
                .get_list("extraction", "allowed_domains", &["fallback"])
                .await,
            vec!["transactions".to_string(), "auth".to_string()]
        );
        assert_eq!(
            store.get_list("extraction", "missing", &["fallback"]).await,
            vec!["fallback".to_string()]
        );
    }

    #[tokio::test]
    async fn test_builtin_project_routing() {
        let store = ConfigStore::new(None, flags_off());
        assert!(store.is_file_based("FILE_A").await.unwrap());
        assert!(store.is_remote_based("REMOTE_A").await.unwrap());
        assert!(store.get_project("NOPE").await.is_err());
    }

    #[tokio::test]
    async fn test_db_project_overrides_builtin() {
        let store = ConfigStore::in_memory().unwrap();
        store
            .database()
            .unwrap()
            .upsert_project(&Project {
                project_code: "FILE_A".to_string(),
                project_name: "Rerouted".to_string(),
                source: LogSourceType::Remote,
            })
            .unwrap();

        assert!(store.is_remote_based("FILE_A").await.unwrap());
    }

    #[tokio::test]
    async fn test_context_rules_default_empty() {
        let store = ConfigStore::new(None, flags_off());
        assert!(store.get_context_rules("transactions").await.is_empty());
    }
}
