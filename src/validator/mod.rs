//! Workflow validator, linter, and compiler.
//!
//! Stateless library over JSON documents in three stages: `template`
//! (authoring, lenient), `executable` (fully resolved), and `dag` (the
//! lowered wire format). `validate` blocks on structural violations;
//! `lint` adds non-blocking findings plus auto-repairable errors;
//! `validate_and_compile` runs the whole pipeline.

mod catalog_checks;
mod compiler;
mod models;
mod repair;
mod rules;
mod schema;

pub use compiler::{
    compile_executable, compile_value, trigger_instance_id, CaseDecl, CompileError, ExecutableDoc,
    IfBranchDecl, Step, TriggerDecl,
};
pub use models::{
    CompileOutcome, LintContext, LintFinding, LintOptions, LintReport, RepairRecord, Severity,
    Stage, ValidateOptions, ValidateResponse, ValidationError,
};
pub use repair::apply_repairs;
pub use rules::{registry, run_rules, Rule};

use serde_json::Value;
use tracing::{debug, info};

/// Validate a document at a stage.
///
/// Template validation is catalog-free; executable validation runs
/// structural checks plus catalog existence, parameter, and scope checks;
/// dag validation checks the lowered wire format and graph invariants.
pub fn validate(
    stage: Stage,
    doc: &Value,
    ctx: &LintContext<'_>,
    options: ValidateOptions,
) -> ValidateResponse {
    let mut errors = match stage {
        Stage::Template => schema::check_template(doc),
        Stage::Executable => {
            let mut errors = schema::check_executable(doc);
            errors.extend(catalog_checks::check_catalog(doc, ctx));
            errors
        }
        Stage::Dag => schema::check_dag(doc),
    };

    if options.fail_fast {
        errors.truncate(1);
    }

    debug!(
        stage = stage.as_str(),
        error_count = errors.len(),
        "validation finished"
    );
    ValidateResponse {
        ok: errors.is_empty(),
        errors,
    }
}

/// Run the lint rule registry for a stage.
pub fn lint(stage: Stage, doc: &Value, ctx: &LintContext<'_>, options: LintOptions) -> LintReport {
    rules::run_rules(stage, doc, ctx, options)
}

/// Apply the repairable subset of a report, then re-lint.
///
/// Stops (returns the original document) if repairing introduced any new
/// error, which a correct repair never does.
pub fn attempt_repair(
    stage: Stage,
    doc: &Value,
    ctx: &LintContext<'_>,
    report: &LintReport,
) -> (Value, Vec<RepairRecord>) {
    let (patched, records) = repair::apply_repairs(doc, report);
    if records.is_empty() {
        return (doc.clone(), records);
    }

    let before = report.errors.len();
    let after = lint(stage, &patched, ctx, LintOptions::default());
    if after.errors.len() > before {
        info!(
            stage = stage.as_str(),
            "repair introduced new findings; discarding patch"
        );
        return (doc.clone(), Vec::new());
    }
    (patched, records)
}

/// Full pipeline: validate(executable) -> lint + repair -> lower ->
/// validate(dag) -> lint(dag).
pub fn validate_and_compile(doc: &Value, ctx: &LintContext<'_>) -> CompileOutcome {
    let mut outcome = CompileOutcome {
        ok: false,
        dag: None,
        errors: Vec::new(),
        report: LintReport::default(),
        repairs: Vec::new(),
    };

    // Lint first so repairable errors can be fixed before blocking
    // validation decides.
    let exec_report = lint(Stage::Executable, doc, ctx, LintOptions::default());
    let (patched, repairs) = attempt_repair(Stage::Executable, doc, ctx, &exec_report);
    outcome.repairs = repairs;

    let validation = validate(Stage::Executable, &patched, ctx, ValidateOptions::default());
    if !validation.ok {
        outcome.errors = validation.errors;
        outcome.report = exec_report;
        return outcome;
    }

    // Any repairable error that survived its repair is fatal.
    let post_repair = lint(Stage::Executable, &patched, ctx, LintOptions::default());
    if !post_repair.errors.is_empty() {
        outcome.errors = post_repair
            .errors
            .iter()
            .map(|f| ValidationError::new(&f.code, Stage::Executable, f.path.clone(), f.message.clone()))
            .collect();
        outcome.report = post_repair;
        return outcome;
    }

    let dag = match compiler::compile_value(&patched) {
        Ok(dag) => dag,
        Err(e) => {
            outcome.errors = vec![ValidationError::new(
                "E000",
                Stage::Executable,
                "$",
                e.to_string(),
            )];
            outcome.report = post_repair;
            return outcome;
        }
    };

    let dag_value = match serde_json::to_value(&dag) {
        Ok(value) => value,
        Err(e) => {
            outcome.errors = vec![ValidationError::new(
                "E000",
                Stage::Dag,
                "$",
                e.to_string(),
            )];
            return outcome;
        }
    };
    let dag_validation = validate(Stage::Dag, &dag_value, ctx, ValidateOptions::default());
    if !dag_validation.ok {
        outcome.errors = dag_validation.errors;
        return outcome;
    }

    let mut report = post_repair;
    let dag_report = lint(Stage::Dag, &dag_value, ctx, LintOptions::default());
    report.extend(dag_report.errors);
    report.extend(dag_report.warnings);
    report.extend(dag_report.hints);

    info!(
        workflow_id = %dag.workflow_id,
        version = dag.version,
        nodes = dag.nodes.len(),
        edges = dag.edges.len(),
        repairs = outcome.repairs.len(),
        "compiled executable to DAG"
    );

    outcome.ok = true;
    outcome.dag = Some(dag);
    outcome.report = report;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ActionSpec, InMemoryCatalog, ParamKind, ParamSpec, TriggerSpec};
    use serde_json::json;

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        catalog
            .add_provider("gmail", "Gmail")
            .add_provider("slack", "Slack")
            .add_trigger("gmail", "GMAIL_NEW_MESSAGE", TriggerSpec::default())
            .add_action(
                "slack",
                "SLACK_SEND_MESSAGE",
                ActionSpec {
                    params: vec![
                        ParamSpec { name: "channel".into(), kind: ParamKind::String, required: true },
                        ParamSpec { name: "text".into(), kind: ParamKind::String, required: true },
                    ],
                    required_scopes: vec![],
                    deprecated: false,
                },
            );
        catalog
    }

    fn executable() -> Value {
        json!({
            "workflow_id": "wf-1",
            "version": 1,
            "user_id": "u1",
            "triggers": [{
                "id": "t1", "kind": "event_based", "toolkit_slug": "gmail",
                "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c1",
                "filter": {"label": "INBOX"}, "verify_signature": true,
            }],
            "steps": [{
                "kind": "action", "id": "a1", "tool": "slack",
                "action": "SLACK_SEND_MESSAGE", "connection_id": "c2",
                "input_template": {"channel": "#ops", "text": "{{ inputs.subject }}"},
                "retry": {"retries": 1, "backoff": "linear", "delay_ms": 100},
            }],
        })
    }

    #[test]
    fn pipeline_compiles_valid_executable() {
        let catalog = catalog();
        let ctx = LintContext { catalog: &catalog, connections: None };
        let outcome = validate_and_compile(&executable(), &ctx);
        assert!(outcome.ok, "errors: {:?}", outcome.errors);
        let dag = outcome.dag.unwrap();
        assert_eq!(dag.nodes.len(), 2);
    }

    #[test]
    fn compiled_dag_revalidates_clean() {
        let catalog = catalog();
        let ctx = LintContext { catalog: &catalog, connections: None };
        let outcome = validate_and_compile(&executable(), &ctx);
        let dag_value = serde_json::to_value(outcome.dag.unwrap()).unwrap();
        let response = validate(Stage::Dag, &dag_value, &ctx, ValidateOptions::default());
        assert!(response.ok, "errors: {:?}", response.errors);
    }

    #[test]
    fn pipeline_repairs_then_compiles() {
        let catalog = catalog();
        let ctx = LintContext { catalog: &catalog, connections: None };
        let mut doc = executable();
        // Webhook verification off: repairable E012.
        doc["triggers"][0]["verify_signature"] = json!(false);
        let outcome = validate_and_compile(&doc, &ctx);
        assert!(outcome.ok, "errors: {:?}", outcome.errors);
        assert!(outcome.repairs.iter().any(|r| r.rule_code == "E012"));
    }

    #[test]
    fn pipeline_blocks_on_unknown_action() {
        let catalog = catalog();
        let ctx = LintContext { catalog: &catalog, connections: None };
        let mut doc = executable();
        doc["steps"][0]["action"] = json!("SLACK_NOPE");
        let outcome = validate_and_compile(&doc, &ctx);
        assert!(!outcome.ok);
        assert!(outcome.errors.iter().any(|e| e.code == "E001"));
    }

    #[test]
    fn validate_is_monotone_under_repair() {
        let catalog = catalog();
        let ctx = LintContext { catalog: &catalog, connections: None };
        let mut doc = executable();
        doc["triggers"][0]["verify_signature"] = json!(false);

        let before = lint(Stage::Executable, &doc, &ctx, LintOptions::default());
        let (patched, records) = attempt_repair(Stage::Executable, &doc, &ctx, &before);
        assert!(!records.is_empty());
        let after = lint(Stage::Executable, &patched, &ctx, LintOptions::default());

        // Repair removes only the repaired codes and introduces nothing.
        let repaired: Vec<&str> = records.iter().map(|r| r.rule_code.as_str()).collect();
        for finding in &after.errors {
            assert!(before.errors.iter().any(|f| f.code == finding.code));
            assert!(!repaired.contains(&finding.code.as_str()));
        }
    }
}
