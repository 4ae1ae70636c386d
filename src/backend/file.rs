//! File-scanning log backend.
//!
//! Walks a bounded directory tree beneath the environment's base path,
//! filters files by name/date, and scans them for matching lines. Two
//! safety properties hold on every run: no file outside the canonical base
//! directory is ever opened, and no more than the configured byte budget is
//! read.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{LogSourceType, ProjectEnv};

use super::{LogBackend, LogLine, SearchOutcome, SearchQuery};

const MAX_WALK_DEPTH: usize = 5;
const LOG_EXTENSIONS: [&str; 3] = ["log", "txt", "out"];

/// Adapter scanning log files on the local filesystem.
pub struct FileBackend {
    max_bytes: u64,
}

impl FileBackend {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    fn base_dir(env: &ProjectEnv) -> Result<PathBuf> {
        let base = env
            .base_path
            .as_ref()
            .ok_or_else(|| Error::backend("file backend requires a base log path"))?;
        fs::canonicalize(base)
            .map_err(|e| Error::backend(format!("log base path {}: {e}", base.display())))
    }

    /// Collect candidate files beneath `base`, never following symlinks and
    /// never leaving the canonical base directory.
    fn collect_files(base: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut stack = vec![(base.to_path_buf(), 0usize)];

        while let Some((dir, depth)) = stack.pop() {
            if depth > MAX_WALK_DEPTH {
                continue;
            }
            let entries = fs::read_dir(&dir)
                .map_err(|e| Error::backend(format!("reading {}: {e}", dir.display())))?;
            for entry in entries {
                let entry = entry.map_err(|e| Error::backend(e.to_string()))?;
                let path = entry.path();
                let meta = fs::symlink_metadata(&path)
                    .map_err(|e| Error::backend(e.to_string()))?;
                if meta.is_symlink() {
                    debug!(path = %path.display(), "skipping symlink in log tree");
                    continue;
                }
                if meta.is_dir() {
                    stack.push((path, depth + 1));
                    continue;
                }
                let is_log = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| LOG_EXTENSIONS.contains(&e))
                    .unwrap_or(false);
                if !is_log {
                    continue;
                }
                // Traversal guard: the canonical path must stay inside base.
                let canonical = fs::canonicalize(&path)
                    .map_err(|e| Error::backend(e.to_string()))?;
                if !canonical.starts_with(base) {
                    warn!(path = %path.display(), "refusing file outside the base directory");
                    continue;
                }
                files.push(canonical);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Apply the date-in-filename filter; when nothing matches, the filter
    /// is dropped so an unnamed rotation scheme still gets scanned.
    fn filter_by_date(files: Vec<PathBuf>, date: Option<NaiveDate>) -> Vec<PathBuf> {
        let Some(date) = date else {
            return files;
        };
        let dashed = date.format("%Y-%m-%d").to_string();
        let compact = date.format("%Y%m%d").to_string();
        let matching: Vec<PathBuf> = files
            .iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.contains(&dashed) || n.contains(&compact))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if matching.is_empty() {
            files
        } else {
            matching
        }
    }

    fn scan<F>(base: &Path, files: &[PathBuf], max_bytes: u64, mut on_line: F) -> Result<bool>
    where
        F: FnMut(&Path, LogLine),
    {
        let mut bytes_read: u64 = 0;
        for path in files {
            let file = fs::File::open(path)
                .map_err(|e| Error::backend(format!("opening {}: {e}", path.display())))?;
            let reader = BufReader::new(file);
            let source = path
                .strip_prefix(base)
                .unwrap_or(path)
                .display()
                .to_string();
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    // Binary junk in a log tree is skipped, not fatal.
                    Err(_) => continue,
                };
                bytes_read += line.len() as u64 + 1;
                if bytes_read > max_bytes {
                    warn!(
                        max_bytes,
                        "file scan hit the byte-read safety cap, stopping early"
                    );
                    return Ok(true);
                }
                let mut log_line = LogLine::new(line, source.clone());
                log_line.timestamp = parse_line_timestamp(&log_line.raw);
                on_line(path, log_line);
            }
        }
        Ok(false)
    }
}

/// Best-effort timestamp from a line prefix.
fn parse_line_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let head: String = raw.chars().take(32).collect();
    if let Some(prefix) = head.get(..20.min(head.len())) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(prefix.trim_end()) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for len in [23, 19] {
        if let Some(prefix) = head.get(..len) {
            for format in ["%Y-%m-%d %H:%M:%S%.3f", "%Y-%m-%d %H:%M:%S"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(prefix, format) {
                    return Some(naive.and_utc());
                }
            }
        }
    }
    None
}

#[async_trait]
impl LogBackend for FileBackend {
    async fn find_candidates(
        &self,
        query: &SearchQuery,
        env: &ProjectEnv,
    ) -> Result<SearchOutcome> {
        let base = Self::base_dir(env)?;
        let terms: Vec<String> = query
            .match_terms()
            .iter()
            .map(|t| t.to_lowercase())
            .collect();
        let date = query.date;
        let max_bytes = self.max_bytes;

        spawn_blocking(move || {
            let files = Self::filter_by_date(Self::collect_files(&base)?, date);
            let mut lines = Vec::new();
            let mut matched_sources = std::collections::BTreeSet::new();
            let truncated = Self::scan(&base, &files, max_bytes, |path, line| {
                let haystack = line.raw.to_lowercase();
                let matches =
                    terms.is_empty() || terms.iter().any(|t| haystack.contains(t.as_str()));
                if matches {
                    matched_sources.insert(path.to_path_buf());
                    lines.push(line);
                }
            })?;
            Ok(SearchOutcome {
                lines,
                sources_searched: matched_sources.len(),
                truncated,
            })
        })
        .await
        .map_err(|e| Error::Internal(format!("file scan task failed: {e}")))?
    }

    async fn fetch_by_trace_ids(
        &self,
        ids: &[String],
        env: &ProjectEnv,
    ) -> Result<HashMap<String, Vec<LogLine>>> {
        let base = Self::base_dir(env)?;
        let ids: Vec<String> = ids.to_vec();
        let max_bytes = self.max_bytes;

        spawn_blocking(move || {
            let files = Self::collect_files(&base)?;
            let mut grouped: HashMap<String, Vec<LogLine>> = HashMap::new();
            Self::scan(&base, &files, max_bytes, |_path, line| {
                for id in &ids {
                    if line.raw.contains(id.as_str()) {
                        grouped.entry(id.clone()).or_default().push(line.clone());
                    }
                }
            })?;
            Ok(grouped)
        })
        .await
        .map_err(|e| Error::Internal(format!("file scan task failed: {e}")))?
    }

    fn source_type(&self) -> LogSourceType {
        LogSourceType::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::TempDir;

    fn env_for(dir: &TempDir) -> ProjectEnv {
        ProjectEnv {
            project_code: "FILE_A".to_string(),
            env: "prod".to_string(),
            namespace: None,
            base_path: Some(dir.path().to_path_buf()),
        }
    }

    fn write_log(dir: &TempDir, name: &str, content: &str) {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = fs::File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_find_candidates_matches_terms() {
        let dir = TempDir::new().unwrap();
        write_log(
            &dir,
            "app-2024-07-01.log",
            "2024-07-01 10:00:00 NPSB transfer failed trace_id=abc123def456\n\
             2024-07-01 10:00:01 heartbeat ok\n",
        );
        write_log(&dir, "other.log", "unrelated chatter\n");

        let backend = FileBackend::new(1024 * 1024);
        let query = SearchQuery {
            date: None,
            domain: None,
            keywords: vec!["npsb".to_string()],
        };
        let outcome = backend.find_candidates(&query, &env_for(&dir)).await.unwrap();

        assert_eq!(outcome.lines.len(), 1);
        assert_eq!(outcome.sources_searched, 1);
        assert!(!outcome.truncated);
        assert!(outcome.lines[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn test_date_filter_prefers_named_files() {
        let dir = TempDir::new().unwrap();
        write_log(&dir, "app-2024-07-01.log", "failed on the first\n");
        write_log(&dir, "app-2024-07-02.log", "failed on the second\n");

        let backend = FileBackend::new(1024 * 1024);
        let query = SearchQuery {
            date: NaiveDate::from_ymd_opt(2024, 7, 1),
            domain: None,
            keywords: vec!["failed".to_string()],
        };
        let outcome = backend.find_candidates(&query, &env_for(&dir)).await.unwrap();
        assert_eq!(outcome.lines.len(), 1);
        assert!(outcome.lines[0].raw.contains("first"));
    }

    #[tokio::test]
    async fn test_byte_cap_truncates_scan() {
        let dir = TempDir::new().unwrap();
        let big: String = "failed line with enough text to count\n".repeat(100);
        write_log(&dir, "big.log", &big);

        let backend = FileBackend::new(200);
        let query = SearchQuery {
            date: None,
            domain: None,
            keywords: vec!["failed".to_string()],
        };
        let outcome = backend.find_candidates(&query, &env_for(&dir)).await.unwrap();
        assert!(outcome.truncated);
        assert!(outcome.lines.len() < 100);
    }

    #[tokio::test]
    async fn test_symlink_escape_is_refused() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        write_log(&outside, "secret.log", "secret failed content\n");

        #[cfg(unix)]
        std::os::unix::fs::symlink(
            outside.path().join("secret.log"),
            dir.path().join("link.log"),
        )
        .unwrap();

        let backend = FileBackend::new(1024 * 1024);
        let query = SearchQuery {
            date: None,
            domain: None,
            keywords: vec!["secret".to_string()],
        };
        let outcome = backend.find_candidates(&query, &env_for(&dir)).await.unwrap();
        assert!(outcome.lines.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_by_trace_ids_groups_lines() {
        let dir = TempDir::new().unwrap();
        write_log(
            &dir,
            "svc-a/app.log",
            "start trace_id=aaaa1111bbbb\nfinish trace_id=aaaa1111bbbb\n",
        );
        write_log(&dir, "svc-b/app.log", "start trace_id=cccc2222dddd\n");

        let backend = FileBackend::new(1024 * 1024);
        let grouped = backend
            .fetch_by_trace_ids(
                &["aaaa1111bbbb".to_string(), "cccc2222dddd".to_string()],
                &env_for(&dir),
            )
            .await
            .unwrap();

        assert_eq!(grouped["aaaa1111bbbb"].len(), 2);
        assert_eq!(grouped["cccc2222dddd"].len(), 1);
    }

    #[tokio::test]
    async fn test_missing_base_path_is_backend_error() {
        let backend = FileBackend::new(1024);
        let env = ProjectEnv {
            project_code: "FILE_A".to_string(),
            env: "prod".to_string(),
            namespace: None,
            base_path: Some("/definitely/not/here".into()),
        };
        let err = backend
            .find_candidates(&SearchQuery::default(), &env)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BACKEND_UNAVAILABLE");
    }
}
