//! Log backend adapters.
//!
//! Both adapters expose the same query/fetch surface so every pipeline step
//! after routing is backend-agnostic. Selection happens once, via
//! [`BackendRouter::select`], driven by the project's routing record;
//! downstream steps never branch on project codes.

mod file;
mod remote;

pub use file::FileBackend;
pub use remote::{RemoteBackend, RemoteBackendConfig};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{LogSourceType, ProjectEnv};

/// One log line as returned by any backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Parsed timestamp, when the source provides one
    pub timestamp: Option<DateTime<Utc>>,
    pub raw: String,
    /// Filename or stream identifier the line came from
    pub source: String,
    /// Structured fields, when the source provides them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<HashMap<String, String>>,
}

impl LogLine {
    pub fn new(raw: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            raw: raw.into(),
            source: source.into(),
            fields: None,
        }
    }
}

/// Backend-neutral search terms derived from the extracted parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Single calendar day the search is scoped to
    pub date: Option<NaiveDate>,
    pub domain: Option<String>,
    /// Ordered keyword tokens; a line matches when it contains any of them
    pub keywords: Vec<String>,
}

impl SearchQuery {
    /// Every term a candidate line is matched against.
    pub fn match_terms(&self) -> Vec<String> {
        let mut terms = self.keywords.clone();
        if let Some(domain) = &self.domain {
            terms.push(domain.clone());
        }
        terms
    }
}

/// Result of a candidate search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub lines: Vec<LogLine>,
    /// Files (or streams) that contributed candidates
    pub sources_searched: usize,
    /// Whether the byte-read safety cap cut the scan short
    pub truncated: bool,
}

/// Uniform interface over the file and remote log sources.
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Find candidate lines matching the query.
    async fn find_candidates(&self, query: &SearchQuery, env: &ProjectEnv)
        -> Result<SearchOutcome>;

    /// Gather every line mentioning each of the given trace ids.
    async fn fetch_by_trace_ids(
        &self,
        ids: &[String],
        env: &ProjectEnv,
    ) -> Result<HashMap<String, Vec<LogLine>>>;

    /// Which routing kind this adapter serves.
    fn source_type(&self) -> LogSourceType;
}

/// Holds one adapter per routing kind and selects by project record.
#[derive(Clone)]
pub struct BackendRouter {
    file: Arc<dyn LogBackend>,
    remote: Arc<dyn LogBackend>,
}

impl BackendRouter {
    pub fn new(file: Arc<dyn LogBackend>, remote: Arc<dyn LogBackend>) -> Self {
        Self { file, remote }
    }

    /// Pick the adapter for a project's source type.
    pub fn select(&self, source: LogSourceType) -> Arc<dyn LogBackend> {
        match source {
            LogSourceType::File => Arc::clone(&self.file),
            LogSourceType::Remote => Arc::clone(&self.remote),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_terms_include_domain() {
        let query = SearchQuery {
            date: None,
            domain: Some("transactions".to_string()),
            keywords: vec!["npsb".to_string(), "failed".to_string()],
        };
        assert_eq!(query.match_terms(), vec!["npsb", "failed", "transactions"]);
    }

    #[tokio::test]
    async fn test_router_selects_by_source_type() {
        use testing::StaticBackend;

        let file = Arc::new(StaticBackend::with_lines(LogSourceType::File, vec![], 0));
        let remote = Arc::new(StaticBackend::with_lines(LogSourceType::Remote, vec![], 0));
        let router = BackendRouter::new(file, remote);

        assert_eq!(
            router.select(LogSourceType::File).source_type(),
            LogSourceType::File
        );
        assert_eq!(
            router.select(LogSourceType::Remote).source_type(),
            LogSourceType::Remote
        );
    }
}
