//! Per-trace compilation and artifact writing.
//!
//! COLLECT_TRACES hands this module every line that mentions a trace id;
//! compilation orders them, records provenance, and detects the services
//! involved. Artifacts are written to a temporary path and renamed into
//! place so a failed run never leaves a partial file behind.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::LogLine;
use crate::error::{Error, Result};

/// All log lines sharing one trace identifier, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledTrace {
    pub trace_id: String,
    /// Lines in timestamp order (input order where timestamps tie or miss)
    pub lines: Vec<LogLine>,
    /// Source files / streams the lines were pulled from
    pub sources: BTreeSet<String>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Services mentioned by the lines
    pub services: BTreeSet<String>,
    /// Whether the byte cap cut the compiled payload short
    pub truncated: bool,
}

impl CompiledTrace {
    /// Render the lines as a single text blob for analysis prompts.
    pub fn payload(&self) -> String {
        let mut payload = String::new();
        for line in &self.lines {
            payload.push_str(&line.raw);
            payload.push('\n');
        }
        payload
    }
}

/// Service name detection: structured field first, then `service=` tokens,
/// then the first path segment of the source.
fn detect_service(line: &LogLine) -> Option<String> {
    if let Some(fields) = &line.fields {
        if let Some(service) = fields.get("service") {
            return Some(service.clone());
        }
    }
    for token in line.raw.split_whitespace() {
        if let Some(service) = token.strip_prefix("service=") {
            if !service.is_empty() {
                return Some(service.trim_matches('"').to_string());
            }
        }
    }
    let head = line.source.split(['/', '\\']).next()?;
    if head.is_empty() {
        None
    } else {
        Some(head.trim_end_matches(".log").to_string())
    }
}

/// Compile one trace from its gathered lines.
///
/// `max_bytes` caps the compiled payload; lines past the cap are dropped at
/// the nearest line boundary and the trace is marked truncated.
pub fn compile_trace(trace_id: &str, mut lines: Vec<LogLine>, max_bytes: u64) -> CompiledTrace {
    // Stable by timestamp: untimestamped lines keep their input position.
    lines.sort_by_key(|l| l.timestamp);

    let mut kept = Vec::new();
    let mut bytes: u64 = 0;
    let mut truncated = false;
    for line in lines {
        bytes += line.raw.len() as u64 + 1;
        if bytes > max_bytes {
            truncated = true;
            break;
        }
        kept.push(line);
    }

    let sources: BTreeSet<String> = kept.iter().map(|l| l.source.clone()).collect();
    let services: BTreeSet<String> = kept.iter().filter_map(detect_service).collect();
    let timestamps: Vec<DateTime<Utc>> = kept.iter().filter_map(|l| l.timestamp).collect();

    CompiledTrace {
        trace_id: trace_id.to_string(),
        lines: kept,
        sources,
        first_timestamp: timestamps.iter().min().copied(),
        last_timestamp: timestamps.iter().max().copied(),
        services,
        truncated,
    }
}

/// Filenames must be servable by the download endpoint.
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Write an artifact beneath `dir` atomically: temp file, then rename.
pub fn write_artifact(dir: &Path, filename: &str, content: &str) -> Result<PathBuf> {
    if !is_safe_filename(filename) {
        return Err(Error::Internal(format!(
            "artifact filename {filename:?} fails the safety pattern"
        )));
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Internal(format!("creating {}: {e}", dir.display())))?;

    let final_path = dir.join(filename);
    let tmp_path = dir.join(format!(".{}.tmp-{}", filename, std::process::id()));

    let written = std::fs::write(&tmp_path, content)
        .map_err(|e| Error::Internal(format!("writing {}: {e}", tmp_path.display())));
    if let Err(err) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err);
    }
    if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(Error::Internal(format!(
            "renaming into {}: {e}",
            final_path.display()
        )));
    }
    Ok(final_path)
}

/// Deterministic artifact name for the n-th trace in discovery order.
pub fn artifact_filename(index: usize, trace_id: &str) -> String {
    let slug: String = trace_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();
    format!("trace_{:03}_{}.txt", index + 1, slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn line(raw: &str, source: &str, secs: i64) -> LogLine {
        LogLine {
            timestamp: DateTime::from_timestamp(secs, 0),
            raw: raw.to_string(),
            source: source.to_string(),
            fields: None,
        }
    }

    #[test]
    fn test_compile_orders_and_detects() {
        let lines = vec![
            line("finish service=payments trace_id=t1", "svc-b/app.log", 20),
            line("start service=gateway trace_id=t1", "svc-a/app.log", 10),
        ];
        let trace = compile_trace("t1", lines, 1024);

        assert!(trace.lines[0].raw.contains("start"));
        assert_eq!(trace.sources.len(), 2);
        assert!(trace.services.contains("gateway"));
        assert!(trace.services.contains("payments"));
        assert!(trace.first_timestamp < trace.last_timestamp);
        assert!(!trace.truncated);
    }

    #[test]
    fn test_compile_truncates_at_line_boundary() {
        let lines = vec![
            line("aaaaaaaaaaaaaaaaaaaa", "a.log", 1),
            line("bbbbbbbbbbbbbbbbbbbb", "a.log", 2),
            line("cccccccccccccccccccc", "a.log", 3),
        ];
        let trace = compile_trace("t1", lines, 45);

        assert_eq!(trace.lines.len(), 2);
        assert!(trace.truncated);
        // Payload holds whole lines only.
        assert!(trace.payload().lines().all(|l| l.len() == 20));
    }

    #[test]
    fn test_service_from_structured_fields_wins() {
        let mut log_line = line("plain text", "svc-a/app.log", 1);
        log_line.fields = Some(
            [("service".to_string(), "ledger".to_string())]
                .into_iter()
                .collect(),
        );
        let trace = compile_trace("t1", vec![log_line], 1024);
        assert!(trace.services.contains("ledger"));
    }

    #[test]
    fn test_artifact_filename_shape() {
        let name = artifact_filename(0, "abc-123-def!!");
        assert_eq!(name, "trace_001_abc123def.txt");
        assert!(is_safe_filename(&name));
    }

    #[test]
    fn test_write_artifact_atomic() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(dir.path(), "trace_001_abc.txt", "analysis\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "analysis\n");
        // No temp droppings remain.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_artifact_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        assert!(write_artifact(dir.path(), "../escape.txt", "x").is_err());
        assert!(write_artifact(dir.path(), "a/b.txt", "x").is_err());
        assert!(write_artifact(dir.path(), "", "x").is_err());
    }
}
