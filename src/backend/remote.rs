//! Remote log-aggregation backend.
//!
//! Translates search terms into label-selector query predicates and
//! exchanges them over HTTPS with the configured aggregation endpoint.
//! Every query is byte-capped, time-bounded, retried with exponential
//! backoff on 429/5xx, and cached through [`LogSearchCache`]. Raw
//! downloaded logs land in a scratch directory that is never served.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cache::LogSearchCache;
use crate::error::{Error, Result};
use crate::store::{LogSourceType, ProjectEnv};

use super::{LogBackend, LogLine, SearchOutcome, SearchQuery};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;

/// Connection settings for the aggregation endpoint.
#[derive(Debug, Clone)]
pub struct RemoteBackendConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Cap on response bytes per query
    pub max_bytes: u64,
    pub request_timeout_secs: u64,
    /// Label/value pairs excluded from every query before submission
    pub exclude_labels: Vec<(String, String)>,
}

impl RemoteBackendConfig {
    pub fn new(base_url: impl Into<String>, max_bytes: u64) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            max_bytes,
            request_timeout_secs: 30,
            exclude_labels: Vec::new(),
        }
    }
}

// Aggregation API wire types (streams of [nanos, line] pairs).
#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    streams: Vec<StreamBlock>,
}

#[derive(Debug, Deserialize)]
struct StreamBlock {
    #[serde(default)]
    stream: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(String, String)>,
}

/// Adapter querying the remote log-aggregation HTTP API.
pub struct RemoteBackend {
    config: RemoteBackendConfig,
    http: Client,
    cache: LogSearchCache,
    download_dir: PathBuf,
}

impl RemoteBackend {
    pub fn new(config: RemoteBackendConfig, cache: LogSearchCache) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        let download_dir = std::env::temp_dir().join("loggy-downloads");
        Ok(Self {
            config,
            http,
            cache,
            download_dir,
        })
    }

    fn namespace<'a>(env: &'a ProjectEnv) -> Result<&'a str> {
        env.namespace
            .as_deref()
            .ok_or_else(|| Error::backend("remote backend requires a namespace"))
    }

    fn day_window(date: Option<NaiveDate>) -> (DateTime<Utc>, DateTime<Utc>) {
        match date.and_then(|d| d.and_hms_opt(0, 0, 0)) {
            Some(start) => {
                let start = start.and_utc();
                (start, start + chrono::Duration::days(1))
            }
            None => {
                // Truncated to the hour so undated queries stay cacheable.
                let now = Utc::now();
                let end = now
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                (end - chrono::Duration::days(1), end)
            }
        }
    }

    /// Build the query document sent to the endpoint. The exclude-list is
    /// folded in here, before submission.
    fn build_params(
        &self,
        namespace: &str,
        query: &SearchQuery,
        trace_id: Option<&str>,
    ) -> Value {
        let (start, end) = Self::day_window(query.date);
        let exclude: Vec<Value> = self
            .config
            .exclude_labels
            .iter()
            .map(|(label, value)| json!({"label": label, "value": value}))
            .collect();
        let mut params = json!({
            "namespace": namespace,
            "selector": {"namespace": namespace},
            "exclude": exclude,
            "keywords": query.match_terms(),
            "start": start.timestamp_nanos_opt().unwrap_or_default(),
            "end": end.timestamp_nanos_opt().unwrap_or_default(),
            "limit": 5000,
        });
        if let Some(id) = trace_id {
            params["trace_id"] = json!(id);
        }
        params
    }

    async fn submit(&self, params: &Value) -> Result<Value> {
        let url = format!(
            "{}/api/v1/query",
            self.config.base_url.trim_end_matches('/')
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut builder = self.http.post(&url).json(params);
            if let Some(token) = &self.config.token {
                builder = builder.bearer_auth(token);
            }

            let outcome = builder.send().await;
            let retryable = match &outcome {
                Ok(response) => {
                    let status = response.status();
                    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
                }
                Err(err) => err.is_timeout() || err.is_connect(),
            };

            match outcome {
                Ok(response) if response.status().is_success() => {
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| Error::backend(format!("reading response: {e}")))?;
                    if body.len() as u64 > self.config.max_bytes {
                        return Err(Error::InputTooLarge {
                            got: body.len() as u64,
                            cap: self.config.max_bytes,
                        });
                    }
                    return serde_json::from_slice(&body)
                        .map_err(|e| Error::backend(format!("malformed query response: {e}")));
                }
                Ok(response) if retryable && attempt < MAX_ATTEMPTS => {
                    let status = response.status();
                    let delay = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
                    warn!(%status, attempt, delay_ms = delay, "retrying remote log query");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Ok(response) => {
                    let status = response.status();
                    let detail = response.text().await.unwrap_or_default();
                    return Err(Error::backend(format!(
                        "query endpoint returned {status}: {detail}"
                    )));
                }
                Err(err) if retryable && attempt < MAX_ATTEMPTS => {
                    let delay = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
                    warn!(error = %err, attempt, delay_ms = delay, "retrying remote log query");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => {
                    return Err(Error::backend(format!("query transport failed: {err}")));
                }
            }
        }
    }

    fn parse_lines(response: &Value) -> Result<(Vec<LogLine>, usize)> {
        let parsed: QueryResponse = serde_json::from_value(response.clone())
            .map_err(|e| Error::backend(format!("malformed stream payload: {e}")))?;

        let stream_count = parsed.streams.len();
        let mut lines = Vec::new();
        for block in parsed.streams {
            let source = block
                .stream
                .get("stream_id")
                .or_else(|| block.stream.get("service"))
                .cloned()
                .unwrap_or_else(|| "remote".to_string());
            for (nanos, raw) in block.values {
                let timestamp = nanos
                    .parse::<i64>()
                    .ok()
                    .map(DateTime::from_timestamp_nanos);
                lines.push(LogLine {
                    timestamp,
                    raw,
                    source: source.clone(),
                    fields: Some(block.stream.clone()),
                });
            }
        }
        Ok((lines, stream_count))
    }

    /// Persist the downloaded raw lines to the scratch directory. These
    /// files feed local re-reads only; the download endpoint never serves
    /// them.
    async fn write_download(&self, namespace: &str, lines: &[LogLine]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| Error::Internal(format!("creating download dir: {e}")))?;
        let path = self
            .download_dir
            .join(format!("{}-{}.log", namespace, uuid::Uuid::new_v4()));
        let mut content = String::new();
        for line in lines {
            content.push_str(&line.raw);
            content.push('\n');
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Error::Internal(format!("writing download: {e}")))?;
        debug!(path = %path.display(), lines = lines.len(), "downloaded remote logs");
        Ok(path)
    }
}

#[derive(Serialize, Deserialize)]
struct CachedSearch {
    lines: Vec<LogLine>,
    sources_searched: usize,
}

#[async_trait]
impl LogBackend for RemoteBackend {
    async fn find_candidates(
        &self,
        query: &SearchQuery,
        env: &ProjectEnv,
    ) -> Result<SearchOutcome> {
        let namespace = Self::namespace(env)?;
        let params = self.build_params(namespace, query, None);

        let (cached, _hit) = self
            .cache
            .get_or_fetch(namespace, &params, async {
                let response = self.submit(&params).await?;
                let (lines, sources_searched) = Self::parse_lines(&response)?;
                Ok(serde_json::to_value(CachedSearch {
                    lines,
                    sources_searched,
                })?)
            })
            .await?;

        let decoded: CachedSearch = serde_json::from_value(cached)?;
        self.write_download(namespace, &decoded.lines).await?;

        Ok(SearchOutcome {
            lines: decoded.lines,
            sources_searched: decoded.sources_searched,
            truncated: false,
        })
    }

    async fn fetch_by_trace_ids(
        &self,
        ids: &[String],
        env: &ProjectEnv,
    ) -> Result<HashMap<String, Vec<LogLine>>> {
        let namespace = Self::namespace(env)?;
        let mut grouped = HashMap::new();

        for id in ids {
            let params = self.build_params(namespace, &SearchQuery::default(), Some(id));
            let (cached, _hit) = self
                .cache
                .get_or_fetch(namespace, &params, async {
                    let response = self.submit(&params).await?;
                    let (lines, sources_searched) = Self::parse_lines(&response)?;
                    Ok(serde_json::to_value(CachedSearch {
                        lines,
                        sources_searched,
                    })?)
                })
                .await?;
            let decoded: CachedSearch = serde_json::from_value(cached)?;
            grouped.insert(id.clone(), decoded.lines);
        }

        Ok(grouped)
    }

    fn source_type(&self) -> LogSourceType {
        LogSourceType::Remote
    }
}
