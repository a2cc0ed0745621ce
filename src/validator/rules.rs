//! Lint rule registry.
//!
//! Each rule has a stable code, the stages it applies to, a severity, and
//! an auto-repairability flag. Warnings and hints never block; repairable
//! errors may be fixed by `attempt_repair` and are then re-validated.

use serde_json::Value;

use crate::catalog::ParamKind;
use crate::validator::catalog_checks::{value_matches_kind, walk_actions};
use crate::validator::models::{LintContext, LintFinding, LintOptions, LintReport, Severity, Stage};

/// Parallel fan-out width above which W201 fires.
const FANOUT_WARN_THRESHOLD: usize = 8;

pub struct Rule {
    pub code: &'static str,
    pub stages: &'static [Stage],
    pub severity: Severity,
    pub auto_repairable: bool,
    pub summary: &'static str,
    check: fn(&Value, Stage, &LintContext<'_>) -> Vec<LintFinding>,
}

const EXEC_ONLY: &[Stage] = &[Stage::Executable];
const EXEC_AND_DAG: &[Stage] = &[Stage::Executable, Stage::Dag];
const TEMPLATE_ONLY: &[Stage] = &[Stage::Template];

pub fn registry() -> &'static [Rule] {
    &[
        Rule {
            code: "W201",
            stages: EXEC_AND_DAG,
            severity: Severity::Warning,
            auto_repairable: false,
            summary: "aggressive parallel fan-out",
            check: check_aggressive_fanout,
        },
        Rule {
            code: "W202",
            stages: EXEC_AND_DAG,
            severity: Severity::Warning,
            auto_repairable: false,
            summary: "switch without a default route",
            check: check_missing_choice_guard,
        },
        Rule {
            code: "W501",
            stages: EXEC_ONLY,
            severity: Severity::Warning,
            auto_repairable: false,
            summary: "event trigger without a dedupe filter",
            check: check_no_idempotency,
        },
        Rule {
            code: "W502",
            stages: EXEC_ONLY,
            severity: Severity::Warning,
            auto_repairable: false,
            summary: "action without a retry policy",
            check: check_missing_retry_policy,
        },
        Rule {
            code: "E009",
            stages: EXEC_ONLY,
            severity: Severity::Error,
            auto_repairable: true,
            summary: "scalar parameter bound to a compound value",
            check: check_type_bridge_missing,
        },
        Rule {
            code: "E011",
            stages: EXEC_ONLY,
            severity: Severity::Error,
            auto_repairable: true,
            summary: "poll trigger without a cursor",
            check: check_poll_no_cursor,
        },
        Rule {
            code: "E012",
            stages: EXEC_ONLY,
            severity: Severity::Error,
            auto_repairable: true,
            summary: "webhook trigger without signature verification",
            check: check_webhook_no_verify,
        },
        Rule {
            code: "E013",
            stages: EXEC_AND_DAG,
            severity: Severity::Error,
            auto_repairable: true,
            summary: "plaintext secret in an input template",
            check: check_plaintext_secret,
        },
        Rule {
            code: "H801",
            stages: TEMPLATE_ONLY,
            severity: Severity::Hint,
            auto_repairable: false,
            summary: "template should list missing_information",
            check: check_missing_information,
        },
    ]
}

/// Run every rule applicable to `stage` and collect findings into a report.
pub fn run_rules(
    stage: Stage,
    doc: &Value,
    ctx: &LintContext<'_>,
    options: LintOptions,
) -> LintReport {
    let mut report = LintReport::default();
    let mut total = 0usize;
    for rule in registry() {
        if !rule.stages.contains(&stage) {
            continue;
        }
        for finding in (rule.check)(doc, stage, ctx) {
            if total >= options.max_findings {
                return report;
            }
            total += 1;
            report.push(finding);
        }
    }
    report
}

// ---------------------------------------------------------------------------
// Warning rules
// ---------------------------------------------------------------------------

fn check_aggressive_fanout(doc: &Value, stage: Stage, _ctx: &LintContext<'_>) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    match stage {
        Stage::Executable => {
            for_each_step(doc, &mut |step, path| {
                if step.get("kind").and_then(Value::as_str) != Some("parallel") {
                    return;
                }
                let width = step
                    .get("branches")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                if width > FANOUT_WARN_THRESHOLD {
                    findings.push(
                        LintFinding::new(
                            "W201",
                            Severity::Warning,
                            path,
                            format!("parallel fan-out of {width} branches"),
                        )
                        .with_hint("consider batching branches or using foreach with bounded concurrency"),
                    );
                }
            });
        }
        Stage::Dag => {
            let nodes = doc.get("nodes").and_then(Value::as_array);
            let edges = doc.get("edges").and_then(Value::as_array);
            if let (Some(nodes), Some(edges)) = (nodes, edges) {
                for (i, node) in nodes.iter().enumerate() {
                    if node.get("type").and_then(Value::as_str) != Some("parallel") {
                        continue;
                    }
                    let id = node.get("id").and_then(Value::as_str).unwrap_or_default();
                    let width = edges
                        .iter()
                        .filter(|e| e.get("source").and_then(Value::as_str) == Some(id))
                        .count();
                    if width > FANOUT_WARN_THRESHOLD {
                        findings.push(LintFinding::new(
                            "W201",
                            Severity::Warning,
                            format!("nodes[{i}]"),
                            format!("parallel node '{id}' fans out to {width} successors"),
                        ));
                    }
                }
            }
        }
        Stage::Template => {}
    }
    findings
}

fn check_missing_choice_guard(doc: &Value, stage: Stage, _ctx: &LintContext<'_>) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    match stage {
        Stage::Executable => {
            for_each_step(doc, &mut |step, path| {
                if step.get("kind").and_then(Value::as_str) == Some("switch")
                    && step.get("default_steps").is_none()
                {
                    findings.push(
                        LintFinding::new(
                            "W202",
                            Severity::Warning,
                            path,
                            "switch has no default branch; unmatched values fall through",
                        )
                        .with_hint("add default_steps to handle unmatched selector values"),
                    );
                }
            });
        }
        Stage::Dag => {
            if let Some(nodes) = doc.get("nodes").and_then(Value::as_array) {
                for (i, node) in nodes.iter().enumerate() {
                    if node.get("type").and_then(Value::as_str) == Some("gateway_switch")
                        && node.pointer("/data/default_to").is_none()
                    {
                        findings.push(LintFinding::new(
                            "W202",
                            Severity::Warning,
                            format!("nodes[{i}]"),
                            "switch gateway has no default_to; unmatched values stop the branch",
                        ));
                    }
                }
            }
        }
        Stage::Template => {}
    }
    findings
}

fn check_no_idempotency(doc: &Value, _stage: Stage, _ctx: &LintContext<'_>) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    if let Some(triggers) = doc.get("triggers").and_then(Value::as_array) {
        for (i, trigger) in triggers.iter().enumerate() {
            if trigger.get("kind").and_then(Value::as_str) == Some("event_based")
                && trigger.get("filter").is_none()
            {
                findings.push(
                    LintFinding::new(
                        "W501",
                        Severity::Warning,
                        format!("triggers[{i}]"),
                        "event trigger has no filter; duplicate deliveries each start a run",
                    )
                    .with_hint("add a filter so redeliveries resolve to the same trigger instance"),
                );
            }
        }
    }
    findings
}

fn check_missing_retry_policy(doc: &Value, _stage: Stage, _ctx: &LintContext<'_>) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    let has_global_retry = doc.pointer("/globals/retry").is_some();
    if has_global_retry {
        return findings;
    }
    if let Some(steps) = doc.get("steps").and_then(Value::as_array) {
        walk_actions(steps, "steps", &mut |action, path| {
            if action.get("retry").is_none() {
                findings.push(
                    LintFinding::new(
                        "W502",
                        Severity::Warning,
                        path,
                        "action has no retry policy and no global default",
                    )
                    .with_hint("set retry on the action or a retry default in globals"),
                );
            }
        });
    }
    findings
}

// ---------------------------------------------------------------------------
// Auto-repairable error rules
// ---------------------------------------------------------------------------

fn check_type_bridge_missing(doc: &Value, _stage: Stage, ctx: &LintContext<'_>) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    let Some(steps) = doc.get("steps").and_then(Value::as_array) else {
        return findings;
    };
    walk_actions(steps, "steps", &mut |action, path| {
        let (Some(tool), Some(name)) = (
            action.get("tool").and_then(Value::as_str),
            action.get("action").and_then(Value::as_str),
        ) else {
            return;
        };
        let Some(spec) = ctx.catalog.get_action(tool, name) else {
            return;
        };
        let Some(template) = action.get("input_template").and_then(Value::as_object) else {
            return;
        };
        for (key, value) in template {
            let Some(param) = spec.param(key) else { continue };
            if matches!(param.kind, ParamKind::String) && !value_matches_kind(value, param.kind) {
                findings.push(
                    LintFinding::new(
                        "E009",
                        Severity::Error,
                        format!("{path}.input_template.{key}"),
                        format!(
                            "parameter '{key}' expects a string but the template provides {}",
                            json_kind(value)
                        ),
                    )
                    .with_hint("a JSON-serializing bridge will be inserted")
                    .repairable(),
                );
            }
        }
    });
    findings
}

fn check_poll_no_cursor(doc: &Value, _stage: Stage, _ctx: &LintContext<'_>) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    if let Some(triggers) = doc.get("triggers").and_then(Value::as_array) {
        for (i, trigger) in triggers.iter().enumerate() {
            if trigger.get("delivery").and_then(Value::as_str) == Some("poll")
                && trigger.pointer("/filter/cursor").is_none()
            {
                findings.push(
                    LintFinding::new(
                        "E011",
                        Severity::Error,
                        format!("triggers[{i}].filter.cursor"),
                        "poll trigger has no cursor; every poll would re-deliver history",
                    )
                    .repairable(),
                );
            }
        }
    }
    findings
}

fn check_webhook_no_verify(doc: &Value, _stage: Stage, _ctx: &LintContext<'_>) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    if let Some(triggers) = doc.get("triggers").and_then(Value::as_array) {
        for (i, trigger) in triggers.iter().enumerate() {
            let delivery = trigger
                .get("delivery")
                .and_then(Value::as_str)
                .unwrap_or("webhook");
            if trigger.get("kind").and_then(Value::as_str) == Some("event_based")
                && delivery == "webhook"
                && trigger.get("verify_signature").and_then(Value::as_bool) != Some(true)
            {
                findings.push(
                    LintFinding::new(
                        "E012",
                        Severity::Error,
                        format!("triggers[{i}].verify_signature"),
                        "webhook trigger does not verify delivery signatures",
                    )
                    .repairable(),
                );
            }
        }
    }
    findings
}

fn check_plaintext_secret(doc: &Value, stage: Stage, _ctx: &LintContext<'_>) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    let mut visit = |action: &Value, path: &str| {
        let Some(template) = action.get("input_template").and_then(Value::as_object) else {
            return;
        };
        for (key, value) in template {
            let Some(text) = value.as_str() else { continue };
            if text.contains("{{") {
                continue;
            }
            if secret_key(key) || secret_shaped(text) {
                findings.push(
                    LintFinding::new(
                        "E013",
                        Severity::Error,
                        format!("{path}.input_template.{key}"),
                        format!("parameter '{key}' carries a plaintext secret"),
                    )
                    .with_hint("reference the connection's secret store instead of a literal")
                    .repairable(),
                );
            }
        }
    };

    match stage {
        Stage::Dag => {
            if let Some(nodes) = doc.get("nodes").and_then(Value::as_array) {
                for (i, node) in nodes.iter().enumerate() {
                    if node.get("type").and_then(Value::as_str) == Some("action") {
                        if let Some(data) = node.get("data") {
                            visit(data, &format!("nodes[{i}].data"));
                        }
                    }
                }
            }
        }
        _ => {
            if let Some(steps) = doc.get("steps").and_then(Value::as_array) {
                walk_actions(steps, "steps", &mut visit);
            }
        }
    }
    findings
}

fn check_missing_information(doc: &Value, _stage: Stage, _ctx: &LintContext<'_>) -> Vec<LintFinding> {
    if doc.get("missing_information").is_some() {
        return Vec::new();
    }
    vec![LintFinding::new(
        "H801",
        Severity::Hint,
        "missing_information",
        "templates should enumerate the information still needed to resolve them",
    )]
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Visit every step (any kind) in an executable document.
fn for_each_step(doc: &Value, visit: &mut impl FnMut(&Value, &str)) {
    fn recurse(steps: &[Value], path: &str, visit: &mut impl FnMut(&Value, &str)) {
        for (i, step) in steps.iter().enumerate() {
            let step_path = format!("{path}[{i}]");
            visit(step, &step_path);
            let Some(obj) = step.as_object() else { continue };
            for key in ["else_steps", "default_steps", "body", "on_error"] {
                if let Some(list) = obj.get(key).and_then(Value::as_array) {
                    recurse(list, &format!("{step_path}.{key}"), visit);
                }
            }
            if let Some(branches) = obj.get("branches").and_then(Value::as_array) {
                for (b, branch) in branches.iter().enumerate() {
                    if let Some(list) = branch.get("steps").and_then(Value::as_array) {
                        recurse(list, &format!("{step_path}.branches[{b}].steps"), visit);
                    } else if let Some(list) = branch.as_array() {
                        recurse(list, &format!("{step_path}.branches[{b}]"), visit);
                    }
                }
            }
            if let Some(cases) = obj.get("cases").and_then(Value::as_array) {
                for (c, case) in cases.iter().enumerate() {
                    if let Some(list) = case.get("steps").and_then(Value::as_array) {
                        recurse(list, &format!("{step_path}.cases[{c}].steps"), visit);
                    }
                }
            }
        }
    }
    if let Some(steps) = doc.get("steps").and_then(Value::as_array) {
        recurse(steps, "steps", visit);
    }
}

fn secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    ["api_key", "apikey", "api-key", "token", "secret", "password", "passwd"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Literal values that look like well-known credential formats.
fn secret_shaped(text: &str) -> bool {
    const PREFIXES: &[&str] = &["sk-", "sk_live_", "xoxb-", "xoxp-", "ghp_", "gho_", "AKIA"];
    PREFIXES
        .iter()
        .any(|prefix| text.starts_with(prefix) && text.len() >= prefix.len() + 8)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
