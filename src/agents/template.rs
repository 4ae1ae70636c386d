//! Prompt template rendering.
//!
//! Templates are named-placeholder strings with a declared variable set.
//! Rendering refuses when a declared variable has no value, rather than
//! silently producing a degraded prompt. Only declared placeholders are
//! substituted, so literal braces elsewhere in the template (JSON response
//! sketches, for instance) pass through untouched.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::store::PromptRecord;

/// Render a prompt record with the given variable values.
pub fn render(record: &PromptRecord, values: &HashMap<&str, String>) -> Result<String> {
    let mut rendered = record.template.clone();
    for variable in &record.variables {
        let value = values
            .get(variable.as_str())
            .ok_or_else(|| Error::template_variable(&record.name, variable))?;
        rendered = rendered.replace(&format!("{{{variable}}}"), value);
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(template: &str, variables: &[&str]) -> PromptRecord {
        PromptRecord {
            name: "test".to_string(),
            version: 1,
            template: template.to_string(),
            variables: variables.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_render_substitutes_declared_variables() {
        let record = record("Analyse {trace_id} with {parameters}", &["trace_id", "parameters"]);
        let mut values = HashMap::new();
        values.insert("trace_id", "abc123".to_string());
        values.insert("parameters", "{}".to_string());

        assert_eq!(render(&record, &values).unwrap(), "Analyse abc123 with {}");
    }

    #[test]
    fn test_missing_variable_refuses() {
        let record = record("Needs {trace_id}", &["trace_id"]);
        let err = render(&record, &HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), "LLM_PARSE_ERROR");
        assert!(err.to_string().contains("trace_id"));
    }

    #[test]
    fn test_undeclared_braces_pass_through() {
        let record = record(
            r#"Respond with {"score": 0-100} for {trace_id}"#,
            &["trace_id"],
        );
        let mut values = HashMap::new();
        values.insert("trace_id", "abc".to_string());

        assert_eq!(
            render(&record, &values).unwrap(),
            r#"Respond with {"score": 0-100} for abc"#
        );
    }

    #[test]
    fn test_extra_values_are_ignored() {
        let record = record("Just {a}", &["a"]);
        let mut values = HashMap::new();
        values.insert("a", "one".to_string());
        values.insert("b", "unused".to_string());

        assert_eq!(render(&record, &values).unwrap(), "Just one");
    }
}
