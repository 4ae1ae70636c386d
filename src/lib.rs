//! # loggy-core
//!
//! A streaming log-forensics pipeline. A natural-language incident query
//! comes in over HTTP; structured search parameters come out of an LLM;
//! matching log lines are pulled from a filesystem corpus or a remote
//! aggregation API; traces are compiled, analysed, and verified; progress
//! streams back to the client as Server-Sent Events.
//!
//! ## Core components
//!
//! - **Pipeline**: the staged state machine driving the analysis steps
//! - **Session**: bounded per-request event queues behind the SSE surface
//! - **Cache**: two-tier LLM gateway with single-flight, plus a log-query cache
//! - **Store**: database-backed prompts, settings, and project routing
//! - **Backend**: uniform query/fetch interface over file and remote logs
//! - **Agents**: typed parameter/planning/analysis/verification wrappers
//!
//! ## Example
//!
//! ```rust,ignore
//! use loggy_core::pipeline::{AnalysisRequest, Pipeline};
//!
//! let request = AnalysisRequest {
//!     text: "Show failed NPSB transactions from 2024-07-01".into(),
//!     project: "FILE_A".into(),
//!     env: "prod".into(),
//!     domain: Some("transactions".into()),
//! };
//! tokio::spawn(pipeline.run(session, request));
//! ```

pub mod agents;
pub mod backend;
pub mod cache;
pub mod canonical;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod llm;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod trace;

// Re-exports for convenience
pub use agents::{
    AgentContext, AnalysisArtifact, AnalyzeAgent, ParameterAgent, Parameters, Plan, PlanStep,
    PlanningAgent, TraceSummary, TraceVerdict, VerificationResult, VerifyAgent,
};
pub use backend::{BackendRouter, FileBackend, LogBackend, LogLine, RemoteBackend, SearchQuery};
pub use cache::{
    CacheDiagnostics, CachePolicy, CacheStatus, ComputeOutcome, LlmCacheGateway, LogSearchCache,
};
pub use config::AppConfig;
pub use error::{Error, Result};
pub use events::{EventKind, PipelineEvent, RunStatus};
pub use pipeline::{AnalysisRequest, Pipeline, PipelineConfig, StepBudgets};
pub use session::{AttachError, Session, SessionRegistry, SessionStatus, SessionStream};
pub use store::{ConfigStore, LogSourceType, Project, ProjectEnv, PromptRecord, SqliteConfigStore};
pub use trace::{CompiledTrace, TraceIdExtractor};
