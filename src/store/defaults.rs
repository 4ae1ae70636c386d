//! Compiled-in fallbacks used when the database is unavailable or the
//! corresponding feature flag is off.

use super::{LogSourceType, Project, ProjectEnv, PromptRecord};

/// The four built-in project codes.
pub const BUILTIN_PROJECT_CODES: [&str; 4] = ["FILE_A", "FILE_B", "REMOTE_A", "REMOTE_B"];

/// Compiled-in project records.
pub fn builtin_project(code: &str) -> Option<Project> {
    let (name, source) = match code {
        "FILE_A" => ("Core Banking", LogSourceType::File),
        "FILE_B" => ("Card Switch", LogSourceType::File),
        "REMOTE_A" => ("Payment Gateway", LogSourceType::Remote),
        "REMOTE_B" => ("Wallet Services", LogSourceType::Remote),
        _ => return None,
    };
    Some(Project {
        project_code: code.to_string(),
        project_name: name.to_string(),
        source,
    })
}

/// Compiled-in environment parameters for a built-in project.
pub fn builtin_project_env(code: &str, env: &str) -> Option<ProjectEnv> {
    let project = builtin_project(code)?;
    Some(match project.source {
        LogSourceType::File => ProjectEnv {
            project_code: code.to_string(),
            env: env.to_string(),
            namespace: None,
            base_path: Some(format!("logs/{}/{}", code.to_lowercase(), env).into()),
        },
        LogSourceType::Remote => ProjectEnv {
            project_code: code.to_string(),
            env: env.to_string(),
            namespace: Some(format!("{}-{}", code.to_lowercase(), env)),
            base_path: None,
        },
    })
}

/// Compiled-in fallback for a named prompt.
pub fn fallback_prompt(name: &str) -> Option<PromptRecord> {
    let (template, variables): (&str, &[&str]) = match name {
        "parameter_extraction" => (
            "You extract structured log-search parameters from an incident report.\n\
             Incident: {text}\n\
             Allowed domains: {allowed_domains}\n\
             Allowed query keys: {allowed_keys}\n\
             Excluded query keys: {excluded_keys}\n\
             Respond with strict JSON only:\n\
             {\"time_frame\": \"YYYY-MM-DD or null\", \"domain\": \"one allowed domain or null\", \
             \"query_keys\": [\"snake_case tokens from the allowed list\"]}",
            &["text", "allowed_domains", "allowed_keys", "excluded_keys"],
        ),
        "planning" => (
            "You plan a log-forensics investigation.\n\
             Extracted parameters: {parameters}\n\
             Project: {project_name} (source: {log_source_type})\n\
             Respond with strict JSON only:\n\
             {\"steps\": [{\"name\": \"...\", \"description\": \"...\"}], \
             \"blocking_questions\": [\"questions that must be answered before searching\"]}",
            &["parameters", "project_name", "log_source_type"],
        ),
        "trace_analysis" => (
            "You are a forensic log analyst. Analyse every line of one request trace.\n\
             Trace id: {trace_id}\n\
             Search parameters: {parameters}\n\
             Log lines:\n{log_lines}\n\
             Respond with strict JSON only:\n\
             {\"relevance_score\": 0-100, \"confidence\": \"low|medium|high\", \
             \"key_findings\": [\"...\"], \"recommendation\": \"INCLUDE|EXCLUDE|REVIEW\"}",
            &["trace_id", "parameters", "log_lines"],
        ),
        "entry_analysis" => (
            "Classify a single log entry within trace {trace_id}.\n\
             Entry: {entry}\n\
             Respond with strict JSON only:\n\
             {\"severity\": \"info|warn|error\", \"summary\": \"...\"}",
            &["trace_id", "entry"],
        ),
        "quality_assessment" => (
            "Rate the quality and completeness of these findings.\n\
             Findings: {findings}\n\
             Respond with strict JSON only: {\"quality_score\": 0-100}",
            &["findings"],
        ),
        "verification" => (
            "Verify trace analyses against the user's question and the context rules.\n\
             Search parameters: {parameters}\n\
             Context rules: {context_rules}\n\
             Trace summaries:\n{trace_summaries}\n\
             Respond with strict JSON only:\n\
             {\"traces\": [{\"trace_id\": \"...\", \"relevance_score\": 0-100, \
             \"reasoning\": \"...\"}], \"summary\": \"...\"}",
            &["parameters", "context_rules", "trace_summaries"],
        ),
        _ => return None,
    };

    Some(PromptRecord {
        name: name.to_string(),
        version: 0,
        template: template.to_string(),
        variables: variables.iter().map(|v| v.to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_projects_cover_both_backends() {
        let mut file = 0;
        let mut remote = 0;
        for code in BUILTIN_PROJECT_CODES {
            match builtin_project(code).unwrap().source {
                LogSourceType::File => file += 1,
                LogSourceType::Remote => remote += 1,
            }
        }
        assert_eq!(file, 2);
        assert_eq!(remote, 2);
        assert!(builtin_project("UNKNOWN").is_none());
    }

    #[test]
    fn test_builtin_env_matches_source_type() {
        let env = builtin_project_env("FILE_A", "prod").unwrap();
        assert!(env.base_path.is_some());
        assert!(env.namespace.is_none());

        let env = builtin_project_env("REMOTE_A", "uat").unwrap();
        assert_eq!(env.namespace.as_deref(), Some("remote_a-uat"));
        assert!(env.base_path.is_none());
    }

    #[test]
    fn test_fallback_prompts_declare_their_variables() {
        for name in [
            "parameter_extraction",
            "planning",
            "trace_analysis",
            "entry_analysis",
            "quality_assessment",
            "verification",
        ] {
            let prompt = fallback_prompt(name).unwrap();
            for variable in &prompt.variables {
                assert!(
                    prompt.template.contains(&format!("{{{variable}}}")),
                    "{name} template must reference {{{variable}}}"
                );
            }
        }
        assert!(fallback_prompt("unknown").is_none());
    }
}
