//! Planning agent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Project;

use super::{call_typed, template, AgentContext, Parameters};

/// One step of the investigation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Ordered step descriptors plus any blocking questions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub blocking_questions: Vec<String>,
}

impl Plan {
    /// When true the pipeline halts before SEARCH with `needs_input`.
    pub fn needs_clarification(&self) -> bool {
        !self.blocking_questions.is_empty()
    }
}

/// Produces the investigation plan from parameters and project metadata.
pub struct PlanningAgent;

impl PlanningAgent {
    pub async fn plan(
        ctx: &AgentContext,
        parameters: &Parameters,
        project: &Project,
    ) -> Result<Plan> {
        let record = ctx.store.get_prompt("planning").await?;
        let mut values = HashMap::new();
        values.insert("parameters", serde_json::to_string(parameters)?);
        values.insert("project_name", project.project_name.clone());
        values.insert("log_source_type", project.source.to_string());
        let prompt = template::render(&record, &values)?;

        call_typed(ctx, "planning", prompt, 0.0)
            .await
            .map_err(|err| match err {
                Error::LlmParse(message) => Error::PlanFailed(message),
                other => other,
            })
    }
}
