//! Deterministic auto-repairs for repairable lint errors.
//!
//! Repairs are pure document transforms: the same input always produces the
//! same patch, and re-running a repair on its own output is a no-op (the
//! triggering finding no longer fires).

use serde_json::Value;

use crate::validator::models::{LintFinding, LintReport, RepairRecord};

/// Apply every repairable error in the report. Returns the patched document
/// and a record per applied repair; findings whose path no longer resolves
/// are skipped.
pub fn apply_repairs(doc: &Value, report: &LintReport) -> (Value, Vec<RepairRecord>) {
    let mut patched = doc.clone();
    let mut records = Vec::new();

    for finding in report.repairable_errors() {
        let applied = match finding.code.as_str() {
            "E009" => repair_type_bridge(&mut patched, finding),
            "E011" => repair_poll_cursor(&mut patched, finding),
            "E012" => repair_webhook_verify(&mut patched, finding),
            "E013" => repair_plaintext_secret(&mut patched, finding),
            _ => None,
        };
        if let Some(description) = applied {
            records.push(RepairRecord {
                rule_code: finding.code.clone(),
                description,
                path: finding.path.clone(),
            });
        }
    }

    (patched, records)
}

/// JSON-serialize a compound value bound to a string parameter.
fn repair_type_bridge(doc: &mut Value, finding: &LintFinding) -> Option<String> {
    let target = navigate_mut(doc, &finding.path)?;
    if target.is_string() {
        return None;
    }
    let serialized = serde_json::to_string(target).ok()?;
    *target = Value::String(serialized);
    Some("serialized compound value to a JSON string".to_string())
}

/// Add a null cursor to a poll trigger's filter.
fn repair_poll_cursor(doc: &mut Value, finding: &LintFinding) -> Option<String> {
    // Path shape: triggers[i].filter.cursor
    let trigger_path = finding.path.strip_suffix(".filter.cursor")?;
    let trigger = navigate_mut(doc, trigger_path)?.as_object_mut()?;
    let filter = trigger
        .entry("filter")
        .or_insert_with(|| Value::Object(Default::default()));
    let filter = filter.as_object_mut()?;
    if filter.contains_key("cursor") {
        return None;
    }
    filter.insert("cursor".to_string(), Value::Null);
    Some("added a null poll cursor".to_string())
}

/// Enable webhook signature verification.
fn repair_webhook_verify(doc: &mut Value, finding: &LintFinding) -> Option<String> {
    let trigger_path = finding.path.strip_suffix(".verify_signature")?;
    let trigger = navigate_mut(doc, trigger_path)?.as_object_mut()?;
    if trigger.get("verify_signature").and_then(Value::as_bool) == Some(true) {
        return None;
    }
    trigger.insert("verify_signature".to_string(), Value::Bool(true));
    Some("enabled webhook signature verification".to_string())
}

/// Replace a literal secret with a secret-store reference.
fn repair_plaintext_secret(doc: &mut Value, finding: &LintFinding) -> Option<String> {
    let key = finding.path.rsplit('.').next()?.to_string();
    let target = navigate_mut(doc, &finding.path)?;
    if target.as_str().is_some_and(|s| s.contains("{{")) {
        return None;
    }
    *target = Value::String(format!("{{{{ secrets.{key} }}}}"));
    Some(format!("replaced literal with {{{{ secrets.{key} }}}} reference"))
}

/// Navigate a finding path like `steps[0].branches[1].steps[2].input_template.to`.
fn navigate_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = root;
    for token in path.split('.') {
        if token.is_empty() || token == "$" {
            continue;
        }
        let (name, indices) = split_indices(token)?;
        if !name.is_empty() {
            current = current.as_object_mut()?.get_mut(name)?;
        }
        for index in indices {
            current = current.as_array_mut()?.get_mut(index)?;
        }
    }
    Some(current)
}

/// Split `branches[1][2]` into (`branches`, [1, 2]).
fn split_indices(token: &str) -> Option<(&str, Vec<usize>)> {
    match token.find('[') {
        None => Some((token, Vec::new())),
        Some(first) => {
            let name = &token[..first];
            let mut indices = Vec::new();
            let mut rest = &token[first..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']')?;
                indices.push(stripped[..close].parse().ok()?);
                rest = &stripped[close + 1..];
            }
            if rest.is_empty() {
                Some((name, indices))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::validator::models::{LintContext, LintOptions, Stage};
    use crate::validator::rules::run_rules;
    use serde_json::json;

    fn lint(doc: &Value) -> LintReport {
        let catalog = InMemoryCatalog::new();
        let ctx = LintContext { catalog: &catalog, connections: None };
        run_rules(Stage::Executable, doc, &ctx, LintOptions::default())
    }

    #[test]
    fn repairs_secret_poll_and_webhook_findings() {
        let doc = json!({
            "triggers": [
                {"id": "t1", "kind": "event_based", "toolkit_slug": "gh",
                 "composio_trigger_slug": "GH_POLL", "connection_id": "c",
                 "delivery": "poll", "filter": {"repo": "x"}},
            ],
            "steps": [{
                "kind": "action", "id": "a1", "tool": "x", "action": "Y",
                "connection_id": "c",
                "input_template": {"token": "ghp_0123456789abcdef", "text": "hi"},
            }],
        });
        let report = lint(&doc);
        let (patched, records) = apply_repairs(&doc, &report);

        assert_eq!(patched["triggers"][0]["filter"]["cursor"], Value::Null);
        assert_eq!(
            patched["steps"][0]["input_template"]["token"],
            "{{ secrets.token }}"
        );
        assert!(records.iter().any(|r| r.rule_code == "E011"));
        assert!(records.iter().any(|r| r.rule_code == "E013"));
    }

    #[test]
    fn repair_is_idempotent() {
        let doc = json!({
            "triggers": [],
            "steps": [{
                "kind": "action", "id": "a1", "tool": "x", "action": "Y",
                "connection_id": "c",
                "input_template": {"password": "hunter2-hunter2"},
            }],
        });
        let report = lint(&doc);
        let (patched, first) = apply_repairs(&doc, &report);
        assert_eq!(first.len(), 1);

        let report2 = lint(&patched);
        let (patched2, second) = apply_repairs(&patched, &report2);
        assert!(second.is_empty());
        assert_eq!(patched, patched2);
    }

    #[test]
    fn navigation_handles_nested_indices() {
        let mut doc = json!({
            "steps": [
                {"branches": [
                    {"steps": [{"input_template": {"to": "x"}}]},
                ]},
            ],
        });
        let value =
            navigate_mut(&mut doc, "steps[0].branches[0].steps[0].input_template.to").unwrap();
        assert_eq!(value, &json!("x"));
    }

    #[test]
    fn unresolvable_paths_are_skipped() {
        let doc = json!({"steps": []});
        let mut report = LintReport::default();
        report.push(
            crate::validator::models::LintFinding::new(
                "E013",
                crate::validator::models::Severity::Error,
                "steps[9].input_template.token",
                "ghost",
            )
            .repairable(),
        );
        let (patched, records) = apply_repairs(&doc, &report);
        assert!(records.is_empty());
        assert_eq!(patched, doc);
    }
}
