//! The staged analysis pipeline.
//!
//! One logical task per session drives the steps EXTRACT → PLAN →
//! (CLARIFY) → SEARCH → COLLECT_TRACES → COMPILE → ANALYZE → VERIFY.
//! Each successful transition emits exactly one named event; a fatal
//! failure emits one `error` event and stops. Backend routing is decided
//! once, after EXTRACT, from the project record; everything downstream is
//! backend-agnostic.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::agents::{
    AgentContext, AnalysisArtifact, AnalyzeAgent, ParameterAgent, Parameters, PlanningAgent,
    Recommendation, TraceAnalysis, TraceSummary, VerifyAgent,
};
use crate::backend::{BackendRouter, SearchQuery};
use crate::error::{Error, Result};
use crate::events::{PipelineEvent, RunStatus};
use crate::session::Session;
use crate::store::LogSourceType;
use crate::trace::{artifact_filename, compile_trace, write_artifact, CompiledTrace, TraceIdExtractor};

/// Wall-clock budgets per step, in seconds.
#[derive(Debug, Clone)]
pub struct StepBudgets {
    pub extract: u64,
    pub plan: u64,
    pub search: u64,
    pub collect_traces: u64,
    pub compile: u64,
    pub analyze_per_trace: u64,
    pub verify: u64,
}

impl Default for StepBudgets {
    fn default() -> Self {
        Self {
            extract: 20,
            plan: 10,
            search: 60,
            collect_traces: 30,
            compile: 120,
            analyze_per_trace: 60,
            verify: 60,
        }
    }
}

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bound on concurrent per-trace analyses
    pub analyze_concurrency: usize,
    pub budgets: StepBudgets,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analyze_concurrency: 4,
            budgets: StepBudgets::default(),
        }
    }
}

/// One analysis request as submitted by the client.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub text: String,
    pub project: String,
    pub env: String,
    pub domain: Option<String>,
}

/// The pipeline and its collaborators.
pub struct Pipeline {
    pub agents: AgentContext,
    pub backends: BackendRouter,
    pub analysis_dir: PathBuf,
    pub max_log_bytes: u64,
    pub config: PipelineConfig,
}

/// Per-run carrier; owned exclusively by the running task.
struct RunContext {
    request: AnalysisRequest,
    parameters: Parameters,
    trace_ids: Vec<String>,
    artifacts: Vec<AnalysisArtifact>,
}

/// Run one step under its budget, honouring session cancellation.
async fn step<T, F>(session: &Session, name: &str, budget_secs: u64, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if session.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let started = Instant::now();
    let result = tokio::select! {
        _ = session.cancelled() => Err(Error::Cancelled),
        outcome = tokio::time::timeout(Duration::from_secs(budget_secs), fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::step_timeout(name, budget_secs)),
        },
    };
    info!(
        session_id = %session.id,
        step = name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "pipeline step finished"
    );
    result
}

impl Pipeline {
    /// Drive one session to its terminal event.
    ///
    /// Cancelled runs finalise silently; every other outcome ends the
    /// stream with exactly one of `done` or `error`.
    pub async fn run(self: Arc<Self>, session: Arc<Session>, request: AnalysisRequest) {
        let started = Instant::now();
        match self.run_inner(&session, request).await {
            Ok(status) => {
                let _ = session.emit(PipelineEvent::done(status)).await;
                info!(
                    session_id = %session.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    %status,
                    "run finished"
                );
            }
            Err(Error::Cancelled) => {
                info!(session_id = %session.id, "run cancelled, finalising silently");
            }
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "run failed");
                let _ = session
                    .emit(PipelineEvent::error(err.client_message()))
                    .await;
            }
        }
    }

    async fn run_inner(&self, session: &Arc<Session>, request: AnalysisRequest) -> Result<RunStatus> {
        let budgets = &self.config.budgets;
        let store = &self.agents.store;

        // EXTRACT
        let parameters = step(
            session,
            "EXTRACT",
            budgets.extract,
            ParameterAgent::extract(&self.agents, &request.text),
        )
        .await?;
        session
            .emit(PipelineEvent::extracted_parameters(&parameters))
            .await?;

        // Routing is decided once, here.
        let project = store.get_project(&request.project).await?;
        let env = store.get_project_env(&request.project, &request.env).await?;

        // PLAN
        let plan = step(
            session,
            "PLAN",
            budgets.plan,
            PlanningAgent::plan(&self.agents, &parameters, &project),
        )
        .await?;
        session.emit(PipelineEvent::planned_steps(&plan)).await?;

        if plan.needs_clarification() {
            session
                .emit(PipelineEvent::need_clarification(
                    &plan.blocking_questions,
                    &plan,
                ))
                .await?;
            return Ok(RunStatus::NeedsInput);
        }

        let mut run = RunContext {
            parameters,
            request,
            trace_ids: Vec::new(),
            artifacts: Vec::new(),
        };

        // SEARCH
        let backend = self.backends.select(project.source);
        let query = SearchQuery {
            date: run.parameters.time_frame,
            domain: run
                .parameters
                .domain
                .clone()
                .or_else(|| run.request.domain.clone()),
            keywords: run.parameters.query_keys.clone(),
        };
        let outcome = step(
            session,
            "SEARCH",
            budgets.search,
            backend.find_candidates(&query, &env),
        )
        .await?;
        match project.source {
            LogSourceType::File => {
                session
                    .emit(PipelineEvent::found_relevant_files(outcome.sources_searched))
                    .await?;
            }
            LogSourceType::Remote => {
                session.emit(PipelineEvent::downloaded_logs()).await?;
            }
        }

        // COLLECT_TRACES
        let patterns = store.get_list("extraction", "trace_patterns", &[]).await;
        let extractor = if patterns.is_empty() {
            TraceIdExtractor::default()
        } else {
            TraceIdExtractor::with_patterns(&patterns)
        };
        run.trace_ids = step(session, "COLLECT_TRACES", budgets.collect_traces, async {
            Ok(extractor.extract(outcome.lines.iter().map(|l| l.raw.as_str())))
        })
        .await?;
        session
            .emit(PipelineEvent::found_trace_ids(run.trace_ids.len()))
            .await?;

        let rules_domain = run
            .parameters
            .domain
            .clone()
            .or_else(|| run.request.domain.clone())
            .unwrap_or_default();

        if !run.trace_ids.is_empty() {
            // COMPILE
            let mut grouped = step(
                session,
                "COMPILE",
                budgets.compile,
                backend.fetch_by_trace_ids(&run.trace_ids, &env),
            )
            .await?;
            let traces: Vec<CompiledTrace> = run
                .trace_ids
                .iter()
                .map(|id| {
                    compile_trace(
                        id,
                        grouped.remove(id).unwrap_or_default(),
                        self.max_log_bytes,
                    )
                })
                .collect();
            session
                .emit(PipelineEvent::compiled_request_traces(traces.len()))
                .await?;

            // ANALYZE
            let artifacts = self
                .analyze_all(session, &run.parameters, &rules_domain, traces)
                .await?;
            run.artifacts = artifacts;
            let created_files: Vec<String> =
                run.artifacts.iter().map(|a| a.filename.clone()).collect();
            session
                .emit(PipelineEvent::compiled_summary(&created_files))
                .await?;
        }

        // VERIFY
        let rules = store.get_context_rules(&rules_domain).await;
        let summaries: Vec<TraceSummary> = run
            .artifacts
            .iter()
            .map(|artifact| TraceSummary {
                trace_id: artifact.trace_id.clone(),
                relevance_score: artifact.analysis.relevance_score,
                recommendation: format!("{:?}", artifact.analysis.recommendation).to_uppercase(),
                key_findings: artifact.analysis.key_findings.clone(),
            })
            .collect();
        let verification = step(
            session,
            "VERIFY",
            budgets.verify,
            VerifyAgent::verify(&self.agents, &summaries, &run.parameters, &rules),
        )
        .await?;
        session
            .emit(PipelineEvent::verification_results(&verification))
            .await?;

        Ok(RunStatus::Complete)
    }

    /// Fan out per-trace analysis bounded by the concurrency semaphore.
    /// Artifact filenames follow discovery order regardless of completion
    /// order; per-trace failures are recorded, never fatal.
    async fn analyze_all(
        &self,
        session: &Arc<Session>,
        parameters: &Parameters,
        rules_domain: &str,
        traces: Vec<CompiledTrace>,
    ) -> Result<Vec<AnalysisArtifact>> {
        let concurrency = self
            .agents
            .store
            .get_i64(
                "pipeline",
                "analyze_concurrency",
                self.config.analyze_concurrency as i64,
            )
            .await
            .clamp(1, 64) as usize;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let per_trace_budget = self.config.budgets.analyze_per_trace;

        let ignore_markers: Vec<String> = self
            .agents
            .store
            .get_context_rules(rules_domain)
            .await
            .iter()
            .filter_map(|r| r.rule.strip_prefix("ignore:"))
            .map(|m| m.trim().to_string())
            .collect();

        let mut handles = Vec::new();
        for (index, trace) in traces.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let agents = self.agents.clone();
            let parameters = parameters.clone();
            let cancel = session.cancel_token();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let mut analysis = tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    outcome = tokio::time::timeout(
                        Duration::from_secs(per_trace_budget),
                        AnalyzeAgent::analyze_trace(&agents, &trace, &parameters),
                    ) => match outcome {
                        Ok(result) => result,
                        Err(_) => Err(Error::step_timeout("ANALYZE", per_trace_budget)),
                    },
                };
                // Borderline verdicts get one entry-level look at the first
                // line so the reviewer has something concrete to start from.
                if let Ok(found) = &mut analysis {
                    if found.recommendation == Recommendation::Review {
                        if let Some(line) = trace.lines.first() {
                            if let Ok(entry) =
                                AnalyzeAgent::analyze_entry(&agents, &trace.trace_id, &line.raw)
                                    .await
                            {
                                found
                                    .key_findings
                                    .push(format!("first entry [{}]: {}", entry.severity, entry.summary));
                            }
                        }
                    }
                }
                (index, trace, analysis)
            }));
        }

        let mut completed: HashMap<usize, (CompiledTrace, Result<TraceAnalysis>)> = HashMap::new();
        for handle in handles {
            let (index, trace, analysis) = handle
                .await
                .map_err(|e| Error::Internal(format!("analysis task failed: {e}")))?;
            completed.insert(index, (trace, analysis));
        }
        if session.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut artifacts = Vec::new();
        let mut succeeded = Vec::new();
        for index in 0..completed.len() {
            let Some((trace, analysis)) = completed.remove(&index) else {
                continue;
            };
            let filename = artifact_filename(index, &trace.trace_id);
            let artifact = match analysis {
                Ok(mut analysis) => {
                    if trace_is_all_ignored(&trace, &ignore_markers) {
                        analysis.recommendation = Recommendation::Exclude;
                    }
                    succeeded.push(analysis.clone());
                    AnalysisArtifact {
                        filename,
                        trace_id: trace.trace_id.clone(),
                        analysis,
                        quality_score: None,
                        truncated: trace.truncated,
                        failure: None,
                    }
                }
                Err(err) => {
                    warn!(
                        session_id = %session.id,
                        trace_id = %trace.trace_id,
                        error = %err,
                        "per-trace analysis failed"
                    );
                    AnalysisArtifact {
                        filename,
                        trace_id: trace.trace_id.clone(),
                        analysis: TraceAnalysis::default(),
                        quality_score: None,
                        truncated: trace.truncated,
                        failure: Some(err.client_message()),
                    }
                }
            };
            artifacts.push(artifact);
        }

        // Quality assessment over the successful findings; best effort.
        let quality = if succeeded.is_empty() {
            None
        } else {
            match AnalyzeAgent::assess_quality(&self.agents, &succeeded).await {
                Ok(score) => Some(score),
                Err(err) => {
                    warn!(session_id = %session.id, error = %err, "quality assessment failed");
                    None
                }
            }
        };
        for artifact in &mut artifacts {
            if artifact.failure.is_none() {
                artifact.quality_score = quality;
            }
        }

        for artifact in &artifacts {
            let content = serde_json::to_string_pretty(artifact)?;
            write_artifact(&self.analysis_dir, &artifact.filename, &content)?;
        }

        Ok(artifacts)
    }
}

/// A trace whose every line matches an ignore marker is still analysed,
/// but its recommendation defaults to EXCLUDE.
fn trace_is_all_ignored(trace: &CompiledTrace, markers: &[String]) -> bool {
    if markers.is_empty() || trace.lines.is_empty() {
        return false;
    }
    trace
        .lines
        .iter()
        .all(|line| markers.iter().any(|marker| line.raw.contains(marker.as_str())))
}
