//! Trace identifier extraction from raw log lines.
//!
//! An ordered pattern list is applied per line; the first pattern with at
//! least one match wins for that line, and every capture of that pattern
//! contributes a token. Output order is first occurrence in the input,
//! with duplicates collapsed.

use std::collections::HashSet;

use regex::Regex;
use tracing::debug;

const MIN_ID_LENGTH: usize = 8;
const MAX_ID_LENGTH: usize = 128;
const PLACEHOLDER_VALUES: [&str; 6] = ["null", "0", "-", "undefined", "none", "n/a"];

/// Extracts trace identifiers using an ordered regex pattern list.
pub struct TraceIdExtractor {
    patterns: Vec<Regex>,
}

impl Default for TraceIdExtractor {
    fn default() -> Self {
        // Order matters: explicit labels beat header forms beat bare tokens.
        let sources = [
            r#"(?i)trace[_-]?id["']?\s*[:=]\s*["']?([A-Za-z0-9._-]{4,128})"#,
            r#"(?i)correlation[_-]?id["']?\s*[:=]\s*["']?([A-Za-z0-9._-]{4,128})"#,
            r#"(?i)x-request-id\s*[:=]\s*["']?([A-Za-z0-9._-]{4,128})"#,
            r"\b([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\b",
            r"\[([A-Za-z0-9]{16,64})\]",
        ];
        let patterns = sources
            .iter()
            .filter_map(|source| match Regex::new(source) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    debug!(source, error = %err, "skipping invalid trace pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }
}

impl TraceIdExtractor {
    /// Build from custom pattern sources; invalid patterns are skipped.
    pub fn with_patterns(sources: &[String]) -> Self {
        let patterns = sources
            .iter()
            .filter_map(|source| match Regex::new(source) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    debug!(source, error = %err, "skipping invalid trace pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Whether a captured token is an acceptable identifier.
    fn accept(token: &str) -> bool {
        if token.len() < MIN_ID_LENGTH || token.len() > MAX_ID_LENGTH {
            return false;
        }
        !PLACEHOLDER_VALUES
            .iter()
            .any(|p| token.eq_ignore_ascii_case(p))
    }

    /// Extract the identifier set from raw lines, in first-occurrence order.
    pub fn extract<'a, I>(&self, lines: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();

        for line in lines {
            for pattern in &self.patterns {
                let mut matched = false;
                for captures in pattern.captures_iter(line) {
                    if let Some(token) = captures.get(1) {
                        matched = true;
                        let token = token.as_str();
                        if Self::accept(token) && seen.insert(token.to_string()) {
                            ordered.push(token.to_string());
                        }
                    }
                }
                // First pattern with a match wins for this line.
                if matched {
                    break;
                }
            }
        }

        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_labelled_trace_id() {
        let extractor = TraceIdExtractor::default();
        let ids = extractor.extract(["2024-07-01 trace_id=abc123def456 NPSB failed"]);
        assert_eq!(ids, vec!["abc123def456"]);
    }

    #[test]
    fn test_first_pattern_wins_per_line() {
        let extractor = TraceIdExtractor::default();
        // Both a labelled id and a bracketed token appear; the labelled
        // pattern is earlier in the list, so only its capture counts.
        let ids = extractor.extract(["trace_id=abc123def456 [ffffaaaa11112222bbbb]"]);
        assert_eq!(ids, vec!["abc123def456"]);
    }

    #[test]
    fn test_multiple_ids_per_line() {
        let extractor = TraceIdExtractor::default();
        let ids = extractor.extract(["fan-out trace_id=abc123def456 trace_id=def456abc789"]);
        assert_eq!(ids, vec!["abc123def456", "def456abc789"]);
    }

    #[test]
    fn test_rejects_placeholders_and_short_values() {
        let extractor = TraceIdExtractor::default();
        let ids = extractor.extract([
            "trace_id=null",
            "trace_id=undefined",
            "trace_id=short",
            "trace_id=0",
        ]);
        assert!(ids.is_empty());
    }

    #[test]
    fn test_uuid_form() {
        let extractor = TraceIdExtractor::default();
        let ids = extractor.extract(["request 550e8400-e29b-41d4-a716-446655440000 done"]);
        assert_eq!(ids, vec!["550e8400-e29b-41d4-a716-446655440000"]);
    }

    #[test]
    fn test_first_occurrence_order_and_dedup() {
        let extractor = TraceIdExtractor::default();
        let lines = [
            "trace_id=bbbb2222cccc start",
            "trace_id=aaaa1111dddd start",
            "trace_id=bbbb2222cccc end",
        ];
        let ids = extractor.extract(lines);
        assert_eq!(ids, vec!["bbbb2222cccc", "aaaa1111dddd"]);
    }

    #[test]
    fn test_idempotent_over_duplicated_input() {
        let extractor = TraceIdExtractor::default();
        let lines = vec![
            "trace_id=aaaa1111dddd start",
            "trace_id=bbbb2222cccc start",
        ];
        let doubled: Vec<&str> = lines.iter().chain(lines.iter()).copied().collect();

        assert_eq!(extractor.extract(lines), extractor.extract(doubled));
    }

    #[test]
    fn test_deterministic() {
        let extractor = TraceIdExtractor::default();
        let lines = ["correlation_id=xyz9876543 [aaaabbbbccccdddd1234]"];
        assert_eq!(extractor.extract(lines), extractor.extract(lines));
    }

    #[test]
    fn test_custom_patterns() {
        let extractor =
            TraceIdExtractor::with_patterns(&[r"req<([a-z0-9]{8,})>".to_string()]);
        let ids = extractor.extract(["handled req<deadbeef01> ok"]);
        assert_eq!(ids, vec!["deadbeef01"]);
    }
}
