//! Structural (schema and graph) checks per stage.
//!
//! These are the blocking checks behind `validate`. Template is lenient:
//! only unknown node kinds and malformed shapes are fatal, placeholders
//! are allowed everywhere. Executable requires fully resolved actions and
//! triggers. Dag validates the lowered wire format strictly, including
//! unknown-field rejection.

use std::collections::HashSet;

use serde_json::Value;

use crate::dag::{Dag, DagError, JoinMode, NodeData};
use crate::parser;
use crate::schedule;
use crate::template::placeholder_names;
use crate::validator::models::{Stage, ValidationError};

pub const STEP_KINDS: &[&str] = &["action", "if", "switch", "parallel", "while", "foreach"];
pub const TRIGGER_KINDS: &[&str] = &["event_based", "schedule_based"];

/// Roots a template placeholder may reference.
const PLACEHOLDER_ROOTS: &[&str] = &["inputs", "vars", "globals", "node", "secrets"];

// ---------------------------------------------------------------------------
// Template stage
// ---------------------------------------------------------------------------

pub fn check_template(doc: &Value) -> Vec<ValidationError> {
    let stage = Stage::Template;
    let mut errors = Vec::new();

    let Some(root) = doc.as_object() else {
        errors.push(ValidationError::new(
            "E000",
            stage,
            "$",
            "document must be a JSON object",
        ));
        return errors;
    };

    if let Some(triggers) = root.get("triggers") {
        match triggers.as_array() {
            Some(items) => {
                for (i, trigger) in items.iter().enumerate() {
                    check_trigger_shape(trigger, &format!("triggers[{i}]"), stage, false, &mut errors);
                }
            }
            None => errors.push(ValidationError::new(
                "E000",
                stage,
                "triggers",
                "triggers must be an array",
            )),
        }
    }

    if let Some(steps) = root.get("steps") {
        match steps.as_array() {
            Some(items) => check_step_kinds(items, "steps", stage, &mut errors),
            None => errors.push(ValidationError::new(
                "E000",
                stage,
                "steps",
                "steps must be an array",
            )),
        }
    }

    errors
}

/// Only the step *kinds* are fatal at the template stage.
fn check_step_kinds(steps: &[Value], path: &str, stage: Stage, errors: &mut Vec<ValidationError>) {
    for (i, step) in steps.iter().enumerate() {
        let step_path = format!("{path}[{i}]");
        let Some(obj) = step.as_object() else {
            errors.push(ValidationError::new(
                "E000",
                stage,
                &step_path,
                "step must be a JSON object",
            ));
            continue;
        };
        let kind = obj.get("kind").and_then(Value::as_str).unwrap_or_default();
        if !STEP_KINDS.contains(&kind) {
            errors.push(ValidationError::new(
                "E000",
                stage,
                format!("{step_path}.kind"),
                format!("unknown step kind '{kind}'"),
            ));
            continue;
        }
        for (nested, key) in nested_step_lists(obj) {
            check_step_kinds(nested, &format!("{step_path}.{key}"), stage, errors);
        }
    }
}

// ---------------------------------------------------------------------------
// Executable stage
// ---------------------------------------------------------------------------

pub fn check_executable(doc: &Value) -> Vec<ValidationError> {
    let stage = Stage::Executable;
    let mut errors = Vec::new();

    let Some(root) = doc.as_object() else {
        errors.push(ValidationError::new(
            "E000",
            stage,
            "$",
            "document must be a JSON object",
        ));
        return errors;
    };

    for field in ["workflow_id", "user_id"] {
        if root.get(field).and_then(Value::as_str).is_none() {
            errors.push(ValidationError::new(
                "E000",
                stage,
                field,
                format!("'{field}' must be a string"),
            ));
        }
    }
    if root.get("version").and_then(Value::as_u64).is_none() {
        errors.push(ValidationError::new(
            "E000",
            stage,
            "version",
            "'version' must be a non-negative integer",
        ));
    }

    let mut seen_ids = HashSet::new();

    match root.get("triggers").and_then(Value::as_array) {
        Some(triggers) if !triggers.is_empty() => {
            for (i, trigger) in triggers.iter().enumerate() {
                let path = format!("triggers[{i}]");
                check_trigger_shape(trigger, &path, stage, true, &mut errors);
                record_id(trigger, &path, stage, &mut seen_ids, &mut errors);
            }
        }
        _ => errors.push(ValidationError::new(
            "E000",
            stage,
            "triggers",
            "executable workflows require at least one trigger",
        )),
    }

    match root.get("steps").and_then(Value::as_array) {
        Some(steps) => check_executable_steps(steps, "steps", &mut seen_ids, &mut errors),
        None => errors.push(ValidationError::new(
            "E000",
            stage,
            "steps",
            "steps must be an array",
        )),
    }

    errors
}

fn record_id(
    value: &Value,
    path: &str,
    stage: Stage,
    seen: &mut HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    match value.get("id").and_then(Value::as_str) {
        Some(id) => {
            if id.contains(':') {
                errors.push(ValidationError::new(
                    "E000",
                    stage,
                    format!("{path}.id"),
                    format!("id '{id}' must not contain ':' (reserved for shard scoping)"),
                ));
            }
            if !seen.insert(id.to_string()) {
                errors.push(ValidationError::new(
                    "E005",
                    stage,
                    format!("{path}.id"),
                    format!("duplicate id '{id}'"),
                ));
            }
        }
        None => errors.push(ValidationError::new(
            "E000",
            stage,
            format!("{path}.id"),
            "missing 'id'",
        )),
    }
}

fn check_trigger_shape(
    trigger: &Value,
    path: &str,
    stage: Stage,
    strict: bool,
    errors: &mut Vec<ValidationError>,
) {
    let Some(obj) = trigger.as_object() else {
        errors.push(ValidationError::new(
            "E000",
            stage,
            path,
            "trigger must be a JSON object",
        ));
        return;
    };

    let kind = obj.get("kind").and_then(Value::as_str).unwrap_or_default();
    if !TRIGGER_KINDS.contains(&kind) {
        errors.push(ValidationError::new(
            "E000",
            stage,
            format!("{path}.kind"),
            format!("unknown trigger kind '{kind}'"),
        ));
        return;
    }

    if !strict {
        return;
    }

    if obj.get("toolkit_slug").and_then(Value::as_str).is_none() {
        errors.push(ValidationError::new(
            "E000",
            stage,
            format!("{path}.toolkit_slug"),
            "trigger requires 'toolkit_slug'",
        ));
    }

    match kind {
        "event_based" => {
            if obj.get("composio_trigger_slug").and_then(Value::as_str).is_none() {
                errors.push(ValidationError::new(
                    "E000",
                    stage,
                    format!("{path}.composio_trigger_slug"),
                    "event trigger requires a concrete 'composio_trigger_slug'",
                ));
            }
            if obj.get("connection_id").and_then(Value::as_str).is_none() {
                errors.push(ValidationError::new(
                    "E000",
                    stage,
                    format!("{path}.connection_id"),
                    "event trigger requires 'connection_id'",
                ));
            }
        }
        "schedule_based" => {
            match obj.get("cron_expr").and_then(Value::as_str) {
                Some(expr) => {
                    if let Err(e) = schedule::validate_cron(expr) {
                        errors.push(ValidationError::new(
                            "E010",
                            stage,
                            format!("{path}.cron_expr"),
                            e.to_string(),
                        ));
                    }
                }
                None => errors.push(ValidationError::new(
                    "E010",
                    stage,
                    format!("{path}.cron_expr"),
                    "schedule trigger requires 'cron_expr'",
                )),
            }
            match obj.get("timezone").and_then(Value::as_str) {
                Some(tz) => {
                    if let Err(e) = schedule::parse_timezone(tz) {
                        errors.push(ValidationError::new(
                            "E010",
                            stage,
                            format!("{path}.timezone"),
                            e.to_string(),
                        ));
                    }
                }
                None => errors.push(ValidationError::new(
                    "E010",
                    stage,
                    format!("{path}.timezone"),
                    "schedule trigger requires an IANA 'timezone'",
                )),
            }
        }
        _ => {}
    }
}

fn check_executable_steps(
    steps: &[Value],
    path: &str,
    seen_ids: &mut HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    let stage = Stage::Executable;
    for (i, step) in steps.iter().enumerate() {
        let step_path = format!("{path}[{i}]");
        let Some(obj) = step.as_object() else {
            errors.push(ValidationError::new(
                "E000",
                stage,
                &step_path,
                "step must be a JSON object",
            ));
            continue;
        };
        record_id(step, &step_path, stage, seen_ids, errors);
        let kind = obj.get("kind").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "action" => {
                for field in ["tool", "action", "connection_id"] {
                    if obj.get(field).and_then(Value::as_str).is_none() {
                        errors.push(ValidationError::new(
                            "E000",
                            stage,
                            format!("{step_path}.{field}"),
                            format!("action requires '{field}'"),
                        ));
                    }
                }
                if let Some(template) = obj.get("input_template") {
                    check_placeholder_roots(template, &format!("{step_path}.input_template"), stage, errors);
                } else {
                    errors.push(ValidationError::new(
                        "E000",
                        stage,
                        format!("{step_path}.input_template"),
                        "action requires 'input_template'",
                    ));
                }
            }
            "if" => {
                let branches = obj.get("branches").and_then(Value::as_array);
                match branches {
                    Some(branches) if !branches.is_empty() => {
                        for (b, branch) in branches.iter().enumerate() {
                            let branch_path = format!("{step_path}.branches[{b}]");
                            check_expr(branch.get("expr"), &format!("{branch_path}.expr"), stage, errors);
                        }
                    }
                    _ => errors.push(ValidationError::new(
                        "E000",
                        stage,
                        format!("{step_path}.branches"),
                        "if requires a non-empty 'branches' array",
                    )),
                }
            }
            "switch" => {
                check_expr(obj.get("selector"), &format!("{step_path}.selector"), stage, errors);
                if obj
                    .get("cases")
                    .and_then(Value::as_array)
                    .map(Vec::is_empty)
                    .unwrap_or(true)
                {
                    errors.push(ValidationError::new(
                        "E000",
                        stage,
                        format!("{step_path}.cases"),
                        "switch requires a non-empty 'cases' array",
                    ));
                }
            }
            "parallel" => {
                if obj
                    .get("branches")
                    .and_then(Value::as_array)
                    .map(Vec::is_empty)
                    .unwrap_or(true)
                {
                    errors.push(ValidationError::new(
                        "E000",
                        stage,
                        format!("{step_path}.branches"),
                        "parallel requires a non-empty 'branches' array",
                    ));
                }
                let mode = obj.get("join_mode").and_then(Value::as_str).unwrap_or("all");
                match mode.parse::<JoinMode>() {
                    Ok(JoinMode::Quorum(0)) => errors.push(ValidationError::new(
                        "E014",
                        stage,
                        format!("{step_path}.join_mode"),
                        "quorum must be at least 1",
                    )),
                    Ok(_) => {}
                    Err(e) => errors.push(ValidationError::new(
                        "E014",
                        stage,
                        format!("{step_path}.join_mode"),
                        e,
                    )),
                }
            }
            "while" => {
                check_expr(obj.get("condition"), &format!("{step_path}.condition"), stage, errors);
                if obj.get("max_iterations").and_then(Value::as_u64).is_none() {
                    errors.push(ValidationError::new(
                        "E000",
                        stage,
                        format!("{step_path}.max_iterations"),
                        "while requires integer 'max_iterations'",
                    ));
                }
                check_nonempty_body(obj, &step_path, stage, errors);
            }
            "foreach" => {
                check_expr(obj.get("source"), &format!("{step_path}.source"), stage, errors);
                match obj.get("max_concurrency").and_then(Value::as_u64) {
                    Some(n) if n >= 1 => {}
                    _ => errors.push(ValidationError::new(
                        "E000",
                        stage,
                        format!("{step_path}.max_concurrency"),
                        "foreach requires 'max_concurrency' >= 1",
                    )),
                }
                check_nonempty_body(obj, &step_path, stage, errors);
            }
            other => {
                errors.push(ValidationError::new(
                    "E000",
                    stage,
                    format!("{step_path}.kind"),
                    format!("unknown step kind '{other}'"),
                ));
                continue;
            }
        }

        for (nested, key) in nested_step_lists(obj) {
            check_executable_steps(nested, &format!("{step_path}.{key}"), seen_ids, errors);
        }
    }
}

/// Loops interpret `body[0]` as the body entry, so the body cannot be empty.
fn check_nonempty_body(
    obj: &serde_json::Map<String, Value>,
    step_path: &str,
    stage: Stage,
    errors: &mut Vec<ValidationError>,
) {
    if obj
        .get("body")
        .and_then(Value::as_array)
        .map(Vec::is_empty)
        .unwrap_or(true)
    {
        errors.push(ValidationError::new(
            "E000",
            stage,
            format!("{step_path}.body"),
            "loop requires a non-empty 'body'",
        ));
    }
}

fn check_expr(
    expr: Option<&Value>,
    path: &str,
    stage: Stage,
    errors: &mut Vec<ValidationError>,
) {
    match expr.and_then(Value::as_str) {
        Some(source) => {
            if let Err(e) = parser::parse(source) {
                errors.push(ValidationError::new("E008", stage, path, e.to_string()));
            }
        }
        None => errors.push(ValidationError::new(
            "E000",
            stage,
            path,
            "missing expression",
        )),
    }
}

/// Template placeholders must be rooted in a run-context namespace.
fn check_placeholder_roots(
    template: &Value,
    path: &str,
    stage: Stage,
    errors: &mut Vec<ValidationError>,
) {
    for name in placeholder_names(template) {
        let reference = name.split('|').next().unwrap_or_default().trim();
        let root = reference
            .split(['.', '['])
            .next()
            .unwrap_or_default()
            .trim();
        if !PLACEHOLDER_ROOTS.contains(&root) {
            errors.push(ValidationError::new(
                "E008",
                stage,
                path,
                format!("placeholder '{{{{ {name} }}}}' is not rooted at {PLACEHOLDER_ROOTS:?}"),
            ));
        }
    }
}

/// Step payload keys that hold nested step lists.
fn nested_step_lists<'a>(
    step: &'a serde_json::Map<String, Value>,
) -> Vec<(&'a Vec<Value>, String)> {
    let mut out = Vec::new();
    for key in ["else_steps", "default_steps", "body", "on_error"] {
        if let Some(list) = step.get(key).and_then(Value::as_array) {
            out.push((list, key.to_string()));
        }
    }
    if let Some(branches) = step.get("branches").and_then(Value::as_array) {
        for (i, branch) in branches.iter().enumerate() {
            // if-branches: {expr, steps}; parallel branches: bare lists.
            if let Some(list) = branch.get("steps").and_then(Value::as_array) {
                out.push((list, format!("branches[{i}].steps")));
            } else if let Some(list) = branch.as_array() {
                out.push((list, format!("branches[{i}]")));
            }
        }
    }
    if let Some(cases) = step.get("cases").and_then(Value::as_array) {
        for (i, case) in cases.iter().enumerate() {
            if let Some(list) = case.get("steps").and_then(Value::as_array) {
                out.push((list, format!("cases[{i}].steps")));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// DAG stage
// ---------------------------------------------------------------------------

const DAG_TOP_KEYS: &[&str] = &["workflow_id", "version", "nodes", "edges", "globals"];
const NODE_KEYS: &[&str] = &["id", "type", "data"];
const EDGE_KEYS: &[&str] = &["id", "source", "target", "when", "condition"];

pub fn check_dag(doc: &Value) -> Vec<ValidationError> {
    let stage = Stage::Dag;
    let mut errors = Vec::new();

    let Some(root) = doc.as_object() else {
        errors.push(ValidationError::new(
            "E000",
            stage,
            "$",
            "document must be a JSON object",
        ));
        return errors;
    };

    // Unknown fields are rejected at the DAG stage.
    reject_unknown_keys(root, DAG_TOP_KEYS, "$", stage, &mut errors);
    if let Some(nodes) = root.get("nodes").and_then(Value::as_array) {
        for (i, node) in nodes.iter().enumerate() {
            if let Some(obj) = node.as_object() {
                reject_unknown_keys(obj, NODE_KEYS, &format!("nodes[{i}]"), stage, &mut errors);
                let node_type = obj.get("type").and_then(Value::as_str).unwrap_or_default();
                if let (Some(allowed), Some(data)) = (
                    data_keys_for(node_type),
                    obj.get("data").and_then(Value::as_object),
                ) {
                    reject_unknown_keys(
                        data,
                        allowed,
                        &format!("nodes[{i}].data"),
                        stage,
                        &mut errors,
                    );
                }
            }
        }
    }
    if let Some(edges) = root.get("edges").and_then(Value::as_array) {
        for (i, edge) in edges.iter().enumerate() {
            if let Some(obj) = edge.as_object() {
                reject_unknown_keys(obj, EDGE_KEYS, &format!("edges[{i}]"), stage, &mut errors);
            }
        }
    }
    if !errors.is_empty() {
        return errors;
    }

    let dag: Dag = match serde_json::from_value(doc.clone()) {
        Ok(dag) => dag,
        Err(e) => {
            errors.push(ValidationError::new(
                "E000",
                stage,
                "$",
                format!("document does not match the DAG schema: {e}"),
            ));
            return errors;
        }
    };

    check_dag_typed(&dag, &mut errors);
    errors
}

/// Graph checks over an already-deserialized DAG.
pub fn check_dag_typed(dag: &Dag, errors: &mut Vec<ValidationError>) {
    let stage = Stage::Dag;

    let index = match dag.index() {
        Ok(index) => index,
        Err(err) => {
            let (code, path) = match &err {
                DagError::DuplicateNodeId(_) => ("E005", "nodes"),
                DagError::UnknownEndpoint { .. } => ("E008", "edges"),
                DagError::UnknownBodyStart(..) => ("E008", "nodes"),
                DagError::ImplicitCycle(_) => ("E006", "edges"),
            };
            errors.push(ValidationError::new(code, stage, path, err.to_string()));
            return;
        }
    };

    for (i, node) in dag.nodes.iter().enumerate() {
        if node.id.contains(':') {
            errors.push(ValidationError::new(
                "E000",
                stage,
                format!("nodes[{i}].id"),
                format!("id '{}' must not contain ':' (reserved for shard scoping)", node.id),
            ));
        }
    }

    let trigger_ids: Vec<&str> = dag.trigger_nodes().map(|(n, _)| n.id.as_str()).collect();
    if trigger_ids.is_empty() {
        errors.push(ValidationError::new(
            "E000",
            stage,
            "nodes",
            "a DAG requires at least one trigger node",
        ));
        return;
    }

    let reachable = index.reachable_from(dag, &trigger_ids);
    for node in &dag.nodes {
        if !reachable.contains(&node.id) {
            errors.push(ValidationError::new(
                "E007",
                stage,
                format!("nodes[{}]", node.id),
                format!("node '{}' is not reachable from any trigger", node.id),
            ));
        }
    }

    for (i, node) in dag.nodes.iter().enumerate() {
        let node_path = format!("nodes[{i}]");
        match &node.data {
            NodeData::GatewayIf(data) => {
                for (b, branch) in data.branches.iter().enumerate() {
                    check_dag_expr(&branch.expr, &format!("{node_path}.data.branches[{b}].expr"), errors);
                    check_target_exists(&index, &branch.to, &node_path, errors);
                }
                if let Some(else_to) = &data.else_to {
                    check_target_exists(&index, else_to, &node_path, errors);
                }
            }
            NodeData::GatewaySwitch(data) => {
                check_dag_expr(&data.selector, &format!("{node_path}.data.selector"), errors);
                for case in &data.cases {
                    check_target_exists(&index, &case.to, &node_path, errors);
                }
                if let Some(default_to) = &data.default_to {
                    check_target_exists(&index, default_to, &node_path, errors);
                }
            }
            NodeData::Join(data) => {
                if let JoinMode::Quorum(n) = data.mode {
                    let in_degree = index.in_degree(&node.id) as u32;
                    if n < 1 || n > in_degree {
                        errors.push(ValidationError::new(
                            "E014",
                            stage,
                            format!("{node_path}.data.mode"),
                            format!(
                                "quorum {n} is outside 1..={in_degree} (join in-degree)"
                            ),
                        ));
                    }
                }
            }
            NodeData::LoopWhile(data) => {
                check_dag_expr(&data.condition, &format!("{node_path}.data.condition"), errors);
            }
            NodeData::LoopForeach(data) => {
                check_dag_expr(
                    &data.source_array_expr,
                    &format!("{node_path}.data.source_array_expr"),
                    errors,
                );
            }
            NodeData::Action(data) => {
                if let Some(output_vars) = &data.output_vars {
                    for (var, path) in output_vars {
                        let legal = !path.is_empty()
                            && path.split('.').all(|part| {
                                !part.is_empty()
                                    && part
                                        .chars()
                                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                            });
                        if !legal {
                            errors.push(ValidationError::new(
                                "E008",
                                stage,
                                format!("{node_path}.data.output_vars.{var}"),
                                format!("'{path}' is not a legal result path"),
                            ));
                        }
                    }
                }
            }
            NodeData::Trigger(_) | NodeData::Parallel(_) => {}
        }
    }

    for (i, edge) in dag.edges.iter().enumerate() {
        if let Some(condition) = &edge.condition {
            check_dag_expr(condition, &format!("edges[{i}].condition"), errors);
        }
    }
}

fn check_target_exists(
    index: &crate::dag::DagIndex,
    target: &str,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    if !index.contains(target) {
        errors.push(ValidationError::new(
            "E008",
            Stage::Dag,
            path,
            format!("routing target '{target}' does not exist"),
        ));
    }
}

fn check_dag_expr(source: &str, path: &str, errors: &mut Vec<ValidationError>) {
    if let Err(e) = parser::parse(source) {
        errors.push(ValidationError::new("E008", Stage::Dag, path, e.to_string()));
    }
}

/// Allowed `data` keys per node type; None for unknown types (serde will
/// report those).
fn data_keys_for(node_type: &str) -> Option<&'static [&'static str]> {
    match node_type {
        "trigger" => Some(&[
            "kind",
            "toolkit_slug",
            "composio_trigger_slug",
            "connection_id",
            "filter",
            "cron_expr",
            "timezone",
            "delivery",
            "verify_signature",
            "trigger_instance_id",
        ]),
        "action" => Some(&[
            "tool",
            "action",
            "connection_id",
            "input_template",
            "output_vars",
            "retry",
            "timeout_ms",
        ]),
        "gateway_if" => Some(&["branches", "else_to"]),
        "gateway_switch" => Some(&["selector", "cases", "default_to"]),
        "parallel" => Some(&[]),
        "join" => Some(&["mode"]),
        "loop_while" => Some(&["condition", "body_start", "max_iterations"]),
        "loop_foreach" => Some(&["source_array_expr", "body_start", "max_concurrency"]),
        _ => None,
    }
}

fn reject_unknown_keys(
    obj: &serde_json::Map<String, Value>,
    allowed: &[&str],
    path: &str,
    stage: Stage,
    errors: &mut Vec<ValidationError>,
) {
    for key in obj.keys() {
        if !allowed.contains(&key.as_str()) {
            errors.push(ValidationError::new(
                "E000",
                stage,
                format!("{path}.{key}"),
                format!("unknown field '{key}'"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_allows_placeholders_and_partial_docs() {
        let doc = json!({
            "triggers": [{"kind": "event_based", "toolkit_slug": "{{provider}}"}],
            "steps": [{"kind": "action", "tool": "{{tool}}"}],
        });
        assert!(check_template(&doc).is_empty());
    }

    #[test]
    fn template_rejects_unknown_step_kind() {
        let doc = json!({"steps": [{"kind": "robot"}]});
        let errors = check_template(&doc);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "E000");
        assert_eq!(errors[0].path, "steps[0].kind");
    }

    #[test]
    fn executable_requires_resolved_actions() {
        let doc = json!({
            "workflow_id": "wf",
            "version": 1,
            "user_id": "u",
            "triggers": [{
                "id": "t1", "kind": "event_based", "toolkit_slug": "gmail",
                "composio_trigger_slug": "GMAIL_NEW", "connection_id": "c1",
            }],
            "steps": [{"kind": "action", "id": "a1", "tool": "slack"}],
        });
        let errors = check_executable(&doc);
        let codes: Vec<&str> = errors.iter().map(|e| e.code.as_str()).collect();
        assert!(codes.contains(&"E000"));
        assert!(errors.iter().any(|e| e.path == "steps[0].action"));
        assert!(errors.iter().any(|e| e.path == "steps[0].input_template"));
    }

    #[test]
    fn executable_rejects_bad_cron_and_timezone() {
        let doc = json!({
            "workflow_id": "wf",
            "version": 1,
            "user_id": "u",
            "triggers": [{
                "id": "t1", "kind": "schedule_based", "toolkit_slug": "system",
                "cron_expr": "bogus", "timezone": "Nowhere/City",
            }],
            "steps": [],
        });
        let errors = check_executable(&doc);
        assert_eq!(errors.iter().filter(|e| e.code == "E010").count(), 2);
    }

    #[test]
    fn executable_rejects_duplicate_ids_and_bad_exprs() {
        let doc = json!({
            "workflow_id": "wf",
            "version": 1,
            "user_id": "u",
            "triggers": [{
                "id": "x", "kind": "event_based", "toolkit_slug": "gmail",
                "composio_trigger_slug": "GMAIL_NEW", "connection_id": "c1",
            }],
            "steps": [
                {"kind": "if", "id": "x", "branches": [{"expr": "count >", "steps": []}]},
            ],
        });
        let errors = check_executable(&doc);
        assert!(errors.iter().any(|e| e.code == "E005"));
        assert!(errors.iter().any(|e| e.code == "E008"));
    }

    #[test]
    fn dag_rejects_unknown_fields() {
        let doc = json!({
            "workflow_id": "wf",
            "version": 1,
            "nodes": [],
            "edges": [],
            "extra": true,
        });
        let errors = check_dag(&doc);
        assert!(errors.iter().any(|e| e.code == "E000" && e.path == "$.extra"));
    }

    #[test]
    fn dag_flags_unreachable_nodes() {
        let doc = json!({
            "workflow_id": "wf",
            "version": 1,
            "nodes": [
                {"id": "t", "type": "trigger", "data": {
                    "kind": "event_based", "toolkit_slug": "gmail",
                }},
                {"id": "a", "type": "action", "data": {
                    "tool": "slack", "action": "SEND", "connection_id": "c",
                    "input_template": {},
                }},
            ],
            "edges": [],
        });
        let errors = check_dag(&doc);
        assert!(errors.iter().any(|e| e.code == "E007"));
    }

    #[test]
    fn dag_checks_quorum_bounds() {
        let doc = json!({
            "workflow_id": "wf",
            "version": 1,
            "nodes": [
                {"id": "t", "type": "trigger", "data": {
                    "kind": "event_based", "toolkit_slug": "gmail",
                }},
                {"id": "j", "type": "join", "data": {"mode": "quorum:3"}},
            ],
            "edges": [
                {"id": "e1", "source": "t", "target": "j"},
            ],
        });
        let errors = check_dag(&doc);
        assert!(errors.iter().any(|e| e.code == "E014"));
    }
}
