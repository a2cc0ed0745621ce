//! Catalog-aware checks: tool/trigger existence, parameter specs, scopes.
//!
//! These run at the executable stage, where every slug must be concrete.
//! At the template stage slugs may still be placeholders and the checks
//! are skipped for any value containing one.

use serde_json::Value;

use crate::catalog::ParamKind;
use crate::validator::models::{LintContext, Stage, ValidationError};

pub fn check_catalog(doc: &Value, ctx: &LintContext<'_>) -> Vec<ValidationError> {
    let stage = Stage::Executable;
    let mut errors = Vec::new();

    let Some(root) = doc.as_object() else {
        return errors;
    };

    if let Some(triggers) = root.get("triggers").and_then(Value::as_array) {
        for (i, trigger) in triggers.iter().enumerate() {
            check_trigger(trigger, &format!("triggers[{i}]"), ctx, stage, &mut errors);
        }
    }

    if let Some(steps) = root.get("steps").and_then(Value::as_array) {
        walk_actions(steps, "steps", &mut |action, path| {
            check_action(action, path, ctx, stage, &mut errors);
        });
    }

    errors
}

fn check_trigger(
    trigger: &Value,
    path: &str,
    ctx: &LintContext<'_>,
    stage: Stage,
    errors: &mut Vec<ValidationError>,
) {
    if trigger.get("kind").and_then(Value::as_str) != Some("event_based") {
        return;
    }
    let Some(toolkit) = concrete_str(trigger.get("toolkit_slug")) else {
        return;
    };
    let Some(slug) = concrete_str(trigger.get("composio_trigger_slug")) else {
        return;
    };

    if ctx.catalog.get_provider(toolkit).is_none() {
        errors.push(ValidationError::new(
            "E001",
            stage,
            format!("{path}.toolkit_slug"),
            format!("unknown provider '{toolkit}'"),
        ));
        return;
    }
    if ctx.catalog.get_trigger(toolkit, slug).is_none() {
        errors.push(ValidationError::new(
            "E003",
            stage,
            format!("{path}.composio_trigger_slug"),
            format!("unknown trigger '{slug}' for provider '{toolkit}'"),
        ));
    }
}

fn check_action(
    action: &Value,
    path: &str,
    ctx: &LintContext<'_>,
    stage: Stage,
    errors: &mut Vec<ValidationError>,
) {
    let Some(tool) = concrete_str(action.get("tool")) else {
        return;
    };
    let Some(name) = concrete_str(action.get("action")) else {
        return;
    };

    if ctx.catalog.get_provider(tool).is_none() {
        errors.push(ValidationError::new(
            "E001",
            stage,
            format!("{path}.tool"),
            format!("unknown provider '{tool}'"),
        ));
        return;
    }
    let Some(spec) = ctx.catalog.get_action(tool, name) else {
        errors.push(ValidationError::new(
            "E001",
            stage,
            format!("{path}.action"),
            format!("unknown action '{name}' for provider '{tool}'"),
        ));
        return;
    };

    // Parameter spec checks against input_template keys.
    let template = action
        .get("input_template")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for param in spec.required_params() {
        if !template.contains_key(&param.name) {
            errors.push(
                ValidationError::new(
                    "E002",
                    stage,
                    format!("{path}.input_template.{}", param.name),
                    format!("required parameter '{}' is missing", param.name),
                )
                .with_meta(serde_json::json!({"param": param.name, "required": true})),
            );
        }
    }
    for key in template.keys() {
        if spec.param(key).is_none() {
            errors.push(ValidationError::new(
                "E002",
                stage,
                format!("{path}.input_template.{key}"),
                format!("parameter '{key}' is not declared by {tool}.{name}"),
            ));
        }
    }

    // Scope coverage for the named connection.
    if let (Some(connections), Some(connection_id)) =
        (ctx.connections, concrete_str(action.get("connection_id")))
    {
        match connections.get(connection_id) {
            None => errors.push(ValidationError::new(
                "E004",
                stage,
                format!("{path}.connection_id"),
                format!("connection '{connection_id}' is not registered"),
            )),
            Some(info) if info.toolkit_slug != tool => errors.push(ValidationError::new(
                "E004",
                stage,
                format!("{path}.connection_id"),
                format!(
                    "connection '{connection_id}' belongs to '{}', not '{tool}'",
                    info.toolkit_slug
                ),
            )),
            Some(info) => {
                for scope in &spec.required_scopes {
                    if !info.scopes.contains(scope) {
                        errors.push(
                            ValidationError::new(
                                "E004",
                                stage,
                                format!("{path}.connection_id"),
                                format!(
                                    "connection '{connection_id}' lacks required scope '{scope}'"
                                ),
                            )
                            .with_meta(serde_json::json!({"scope": scope})),
                        );
                    }
                }
            }
        }
    }
}

/// Visit every action step, including ones nested in control constructs.
pub fn walk_actions(steps: &[Value], path: &str, visit: &mut impl FnMut(&Value, &str)) {
    for (i, step) in steps.iter().enumerate() {
        let step_path = format!("{path}[{i}]");
        let Some(obj) = step.as_object() else { continue };
        if obj.get("kind").and_then(Value::as_str) == Some("action") {
            visit(step, &step_path);
        }
        for key in ["else_steps", "default_steps", "body", "on_error"] {
            if let Some(list) = obj.get(key).and_then(Value::as_array) {
                walk_actions(list, &format!("{step_path}.{key}"), visit);
            }
        }
        if let Some(branches) = obj.get("branches").and_then(Value::as_array) {
            for (b, branch) in branches.iter().enumerate() {
                if let Some(list) = branch.get("steps").and_then(Value::as_array) {
                    walk_actions(list, &format!("{step_path}.branches[{b}].steps"), visit);
                } else if let Some(list) = branch.as_array() {
                    walk_actions(list, &format!("{step_path}.branches[{b}]"), visit);
                }
            }
        }
        if let Some(cases) = obj.get("cases").and_then(Value::as_array) {
            for (c, case) in cases.iter().enumerate() {
                if let Some(list) = case.get("steps").and_then(Value::as_array) {
                    walk_actions(list, &format!("{step_path}.cases[{c}].steps"), visit);
                }
            }
        }
    }
}

/// A string that does not still contain template placeholders.
fn concrete_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.contains("{{"))
}

/// Whether a template leaf for `kind` is type-compatible; used by the
/// type-bridge lint.
pub fn value_matches_kind(value: &Value, kind: ParamKind) -> bool {
    match kind {
        ParamKind::Any => true,
        // A placeholder string can render to anything.
        ParamKind::String => value.is_string(),
        ParamKind::Number => value.is_number() || is_placeholder(value),
        ParamKind::Boolean => value.is_boolean() || is_placeholder(value),
        ParamKind::Object => value.is_object() || is_placeholder(value),
        ParamKind::Array => value.is_array() || is_placeholder(value),
    }
}

fn is_placeholder(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.contains("{{"))
}
