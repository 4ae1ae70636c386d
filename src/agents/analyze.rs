//! Trace analysis agent: forensic per-trace analysis, per-entry
//! classification, and quality assessment.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::trace::CompiledTrace;

use super::{call_typed, template, AgentContext, Parameters};

/// Analyst confidence in a trace verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Default for Confidence {
    fn default() -> Self {
        Self::Low
    }
}

/// Whether a trace belongs in the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Include,
    Exclude,
    Review,
}

impl Default for Recommendation {
    fn default() -> Self {
        Self::Review
    }
}

/// Structured findings for one trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceAnalysis {
    #[serde(default)]
    pub relevance_score: u8,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub recommendation: Recommendation,
}

impl TraceAnalysis {
    fn clamp(mut self) -> Self {
        self.relevance_score = self.relevance_score.min(100);
        self
    }
}

/// Severity classification of a single entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryAnalysis {
    pub severity: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct QualityAssessment {
    #[serde(default)]
    quality_score: u8,
}

/// The filename + findings blob written to the analysis directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisArtifact {
    pub filename: String,
    pub trace_id: String,
    pub analysis: TraceAnalysis,
    #[serde(default)]
    pub quality_score: Option<u8>,
    /// Set when the compiled payload was cut at the byte cap
    #[serde(default)]
    pub truncated: bool,
    /// Per-trace failure note when analysis itself failed
    #[serde(default)]
    pub failure: Option<String>,
}

/// Runs the three analysis sub-prompts.
pub struct AnalyzeAgent;

impl AnalyzeAgent {
    /// Single-trace forensic analysis.
    pub async fn analyze_trace(
        ctx: &AgentContext,
        trace: &CompiledTrace,
        parameters: &Parameters,
    ) -> Result<TraceAnalysis> {
        let record = ctx.store.get_prompt("trace_analysis").await?;
        let mut values = HashMap::new();
        values.insert("trace_id", trace.trace_id.clone());
        values.insert("parameters", serde_json::to_string(parameters)?);
        values.insert("log_lines", trace.payload());
        let prompt = template::render(&record, &values)?;

        let analysis: TraceAnalysis = call_typed(ctx, "trace_analysis", prompt, 0.2).await?;
        Ok(analysis.clamp())
    }

    /// Per-entry classification.
    pub async fn analyze_entry(
        ctx: &AgentContext,
        trace_id: &str,
        entry: &str,
    ) -> Result<EntryAnalysis> {
        let record = ctx.store.get_prompt("entry_analysis").await?;
        let mut values = HashMap::new();
        values.insert("trace_id", trace_id.to_string());
        values.insert("entry", entry.to_string());
        let prompt = template::render(&record, &values)?;

        call_typed(ctx, "entry_analysis", prompt, 0.0).await
    }

    /// Quality score over the run's combined findings.
    pub async fn assess_quality(ctx: &AgentContext, findings: &[TraceAnalysis]) -> Result<u8> {
        let record = ctx.store.get_prompt("quality_assessment").await?;
        let mut values = HashMap::new();
        values.insert("findings", serde_json::to_string(findings)?);
        let prompt = template::render(&record, &values)?;

        let assessment: QualityAssessment =
            call_typed(ctx, "quality_assessment", prompt, 0.0).await?;
        Ok(assessment.quality_score.min(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::context_with;
    use crate::backend::LogLine;
    use crate::trace::compile_trace;
    use pretty_assertions::assert_eq;

    fn trace() -> CompiledTrace {
        compile_trace(
            "abc123def456",
            vec![LogLine::new("NPSB failed trace_id=abc123def456", "app.log")],
            1024,
        )
    }

    #[tokio::test]
    async fn test_analyze_trace() {
        let (ctx, _provider) = context_with(vec![
            r#"{"relevance_score": 92, "confidence": "high",
                "key_findings": ["NPSB switch timeout"], "recommendation": "INCLUDE"}"#,
        ]);
        let analysis = AnalyzeAgent::analyze_trace(&ctx, &trace(), &Parameters::default())
            .await
            .unwrap();

        assert_eq!(analysis.relevance_score, 92);
        assert_eq!(analysis.confidence, Confidence::High);
        assert_eq!(analysis.recommendation, Recommendation::Include);
    }

    #[tokio::test]
    async fn test_score_is_clamped() {
        let (ctx, _provider) = context_with(vec![
            r#"{"relevance_score": 250, "confidence": "low",
                "key_findings": [], "recommendation": "REVIEW"}"#,
        ]);
        let analysis = AnalyzeAgent::analyze_trace(&ctx, &trace(), &Parameters::default())
            .await
            .unwrap();
        assert_eq!(analysis.relevance_score, 100);
    }

    #[tokio::test]
    async fn test_entry_analysis() {
        let (ctx, _provider) =
            context_with(vec![r#"{"severity": "error", "summary": "switch timeout"}"#]);
        let entry = AnalyzeAgent::analyze_entry(&ctx, "abc123def456", "ERR timeout")
            .await
            .unwrap();
        assert_eq!(entry.severity, "error");
    }

    #[tokio::test]
    async fn test_quality_assessment() {
        let (ctx, _provider) = context_with(vec![r#"{"quality_score": 77}"#]);
        let score = AnalyzeAgent::assess_quality(&ctx, &[TraceAnalysis::default()])
            .await
            .unwrap();
        assert_eq!(score, 77);
    }
}
