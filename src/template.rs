//! Input template rendering.
//!
//! Action `input_template` values are JSON documents whose string leaves may
//! contain `{{ ... }}` placeholders. Leaves without placeholders pass
//! through untouched; leaves with placeholders are rendered with tera
//! against the run context (`inputs`, `vars`, `globals`, `node`).

use serde_json::Value;
use thiserror::Error;

use crate::ast_evaluator::Scope;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template render error at {path}: {message}")]
    Render { path: String, message: String },
}

/// Render every placeholder-bearing string leaf of `template`.
pub fn render_template(template: &Value, scope: &Scope<'_>) -> Result<Value, TemplateError> {
    let context = build_context(scope);
    render_value(template, &context, "$")
}

fn render_value(
    value: &Value,
    context: &tera::Context,
    path: &str,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) if s.contains("{{") || s.contains("{%") => {
            let rendered = render_leaf(s, context).map_err(|e| TemplateError::Render {
                path: path.to_string(),
                message: tera_message(&e),
            })?;
            Ok(Value::String(rendered))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                let child = format!("{path}.{key}");
                out.insert(key.clone(), render_value(item, context, &child)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let child = format!("{path}[{i}]");
                out.push(render_value(item, context, &child)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_leaf(template: &str, context: &tera::Context) -> tera::Result<String> {
    let mut tera = tera::Tera::default();
    tera.register_filter("extract_email", extract_email_filter);
    tera.add_raw_template("leaf", template)?;
    tera.render("leaf", context)
}

fn build_context(scope: &Scope<'_>) -> tera::Context {
    let mut context = tera::Context::new();
    context.insert("inputs", scope.inputs);
    context.insert("vars", &Value::Object(scope.vars.clone()));
    context.insert("globals", &Value::Object(scope.globals.clone()));
    let node: serde_json::Map<String, Value> = scope
        .node_outputs
        .iter()
        .map(|(id, outputs)| {
            (
                id.clone(),
                serde_json::json!({ "outputs": outputs }),
            )
        })
        .collect();
    context.insert("node", &Value::Object(node));
    context
}

/// `{{ value | extract_email }}` pulls the address out of `Name <addr>`.
fn extract_email_filter(
    value: &Value,
    _args: &std::collections::HashMap<String, Value>,
) -> tera::Result<Value> {
    let Some(s) = value.as_str() else {
        return Ok(value.clone());
    };
    match (s.find('<'), s.find('>')) {
        (Some(start), Some(end)) if start + 1 < end => {
            Ok(Value::String(s[start + 1..end].to_string()))
        }
        _ => Ok(Value::String(s.to_string())),
    }
}

fn tera_message(err: &tera::Error) -> String {
    use std::error::Error;

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// List the `{{name}}` placeholders present anywhere in a template value.
///
/// Used by template-stage validation, where unresolved placeholders are
/// allowed but worth reporting.
pub fn placeholder_names(template: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect_placeholders(template, &mut names);
    names
}

fn collect_placeholders(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("{{") {
                let Some(len) = rest[start + 2..].find("}}") else { break };
                let inner = rest[start + 2..start + 2 + len].trim();
                if !inner.is_empty() && !names.iter().any(|n| n == inner) {
                    names.push(inner.to_string());
                }
                rest = &rest[start + 2 + len + 2..];
            }
        }
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, names)),
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, names)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn scope_parts() -> (Value, serde_json::Map<String, Value>, serde_json::Map<String, Value>, HashMap<String, Value>) {
        let inputs = json!({"sender": "Ada Lovelace <ada@example.com>", "subject": "hi"});
        let mut vars = serde_json::Map::new();
        vars.insert("label".into(), json!("triage"));
        let globals = serde_json::Map::new();
        let mut outputs = HashMap::new();
        outputs.insert("fetch".to_string(), json!({"id": "T-1"}));
        (inputs, vars, globals, outputs)
    }

    #[test]
    fn renders_placeholders_and_passes_literals() {
        let (inputs, vars, globals, outputs) = scope_parts();
        let scope = Scope {
            inputs: &inputs,
            vars: &vars,
            globals: &globals,
            node_outputs: &outputs,
        };
        let template = json!({
            "to": "{{ inputs.sender | extract_email }}",
            "subject": "Re: {{ inputs.subject }}",
            "label": "{{ vars.label }}",
            "ticket": "{{ node.fetch.outputs.id }}",
            "static": "unchanged",
            "count": 3,
        });
        let rendered = render_template(&template, &scope).unwrap();
        assert_eq!(rendered["to"], "ada@example.com");
        assert_eq!(rendered["subject"], "Re: hi");
        assert_eq!(rendered["label"], "triage");
        assert_eq!(rendered["ticket"], "T-1");
        assert_eq!(rendered["static"], "unchanged");
        assert_eq!(rendered["count"], 3);
    }

    #[test]
    fn render_error_carries_path() {
        let (inputs, vars, globals, outputs) = scope_parts();
        let scope = Scope {
            inputs: &inputs,
            vars: &vars,
            globals: &globals,
            node_outputs: &outputs,
        };
        let template = json!({"body": "{{ vars.missing }}"});
        let err = render_template(&template, &scope).unwrap_err();
        let TemplateError::Render { path, .. } = err;
        assert_eq!(path, "$.body");
    }

    #[test]
    fn placeholder_names_are_collected_once() {
        let template = json!({
            "a": "{{ inputs.x }}",
            "b": ["{{ inputs.x }}", "{{ vars.y }}"],
        });
        let names = placeholder_names(&template);
        assert_eq!(names, vec!["inputs.x".to_string(), "vars.y".to_string()]);
    }
}
