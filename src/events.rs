//! Pipeline event types streamed to clients over SSE.
//!
//! Every successful orchestrator transition emits exactly one named event;
//! a run terminates with exactly one of `done` or `error`. The wire names
//! below are part of the public contract and must not drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Wire-level event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "Extracted Parameters")]
    ExtractedParameters,
    #[serde(rename = "Planned Steps")]
    PlannedSteps,
    #[serde(rename = "Need Clarification")]
    NeedClarification,
    #[serde(rename = "Found relevant files")]
    FoundRelevantFiles,
    #[serde(rename = "Downloaded logs in file")]
    DownloadedLogs,
    #[serde(rename = "Found trace id(s)")]
    FoundTraceIds,
    #[serde(rename = "Compiled Request Traces")]
    CompiledRequestTraces,
    #[serde(rename = "Compiled Summary")]
    CompiledSummary,
    #[serde(rename = "Verification Results")]
    VerificationResults,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "error")]
    Error,
}

impl EventKind {
    /// The `event:` field value on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::ExtractedParameters => "Extracted Parameters",
            Self::PlannedSteps => "Planned Steps",
            Self::NeedClarification => "Need Clarification",
            Self::FoundRelevantFiles => "Found relevant files",
            Self::DownloadedLogs => "Downloaded logs in file",
            Self::FoundTraceIds => "Found trace id(s)",
            Self::CompiledRequestTraces => "Compiled Request Traces",
            Self::CompiledSummary => "Compiled Summary",
            Self::VerificationResults => "Verification Results",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Whether this event terminates its session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// Terminal run status carried in the `done` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    NeedsInput,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::NeedsInput => write!(f, "needs_input"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One event emitted by a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub kind: EventKind,
    /// JSON payload as it appears in the SSE `data:` field
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Render the SSE frame for this event.
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind.wire_name(), self.data)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    // Constructors for each pipeline transition.

    pub fn extracted_parameters(parameters: &impl Serialize) -> Self {
        Self::new(
            EventKind::ExtractedParameters,
            json!({ "parameters": serde_json::to_value(parameters).unwrap_or(Value::Null) }),
        )
    }

    pub fn planned_steps(plan: &impl Serialize) -> Self {
        Self::new(
            EventKind::PlannedSteps,
            json!({ "plan": serde_json::to_value(plan).unwrap_or(Value::Null) }),
        )
    }

    pub fn need_clarification(questions: &[String], plan: &impl Serialize) -> Self {
        Self::new(
            EventKind::NeedClarification,
            json!({
                "questions": questions,
                "plan": serde_json::to_value(plan).unwrap_or(Value::Null),
            }),
        )
    }

    pub fn found_relevant_files(total_files: usize) -> Self {
        Self::new(
            EventKind::FoundRelevantFiles,
            json!({ "total_files": total_files }),
        )
    }

    pub fn downloaded_logs() -> Self {
        Self::new(EventKind::DownloadedLogs, json!({}))
    }

    pub fn found_trace_ids(count: usize) -> Self {
        Self::new(EventKind::FoundTraceIds, json!({ "count": count }))
    }

    pub fn compiled_request_traces(traces_compiled: usize) -> Self {
        Self::new(
            EventKind::CompiledRequestTraces,
            json!({ "traces_compiled": traces_compiled }),
        )
    }

    pub fn compiled_summary(created_files: &[String]) -> Self {
        Self::new(
            EventKind::CompiledSummary,
            json!({ "created_files": created_files }),
        )
    }

    pub fn verification_results(results: &impl Serialize) -> Self {
        Self::new(
            EventKind::VerificationResults,
            serde_json::to_value(results).unwrap_or(Value::Null),
        )
    }

    pub fn done(status: RunStatus) -> Self {
        Self::new(EventKind::Done, json!({ "status": status.to_string() }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, json!({ "error": message.into() }))
    }
}
