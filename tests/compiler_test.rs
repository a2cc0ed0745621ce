//! Validator/compiler pipeline: the compile round-trip law, repair
//! behavior, and lowering determinism.

use proptest::prelude::*;
use serde_json::{json, Value};

use weave::catalog::{ActionSpec, InMemoryCatalog, ParamKind, ParamSpec, TriggerSpec};
use weave::validator::{
    lint, validate, validate_and_compile, LintContext, LintOptions, Stage, ValidateOptions,
};

fn catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    catalog
        .add_provider("gmail", "Gmail")
        .add_provider("jira", "Jira")
        .add_provider("slack", "Slack")
        .add_trigger("gmail", "GMAIL_NEW_MESSAGE", TriggerSpec::default())
        .add_action(
            "jira",
            "JIRA_CREATE_ISSUE",
            ActionSpec {
                params: vec![
                    ParamSpec { name: "summary".into(), kind: ParamKind::String, required: true },
                    ParamSpec { name: "labels".into(), kind: ParamKind::Array, required: false },
                ],
                required_scopes: vec![],
                deprecated: false,
            },
        )
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

/// A workflow exercising every control construct.
fn kitchen_sink() -> Value {
    json!({
        "workflow_id": "wf-sink",
        "version": 3,
        "user_id": "u-9",
        "globals": {
            "retry": {"retries": 2, "backoff": "exponential", "delay_ms": 200},
            "timeout_ms": 30_000,
            "vars": {"team": "platform"},
        },
        "triggers": [{
            "id": "mail", "kind": "event_based", "toolkit_slug": "gmail",
            "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c-gmail",
            "filter": {"label": "INBOX"}, "verify_signature": true,
        }],
        "steps": [
            {
                "kind": "if", "id": "triage",
                "branches": [{"expr": "inputs.urgent == true", "steps": [
                    {"kind": "action", "id": "file_bug", "tool": "jira",
                     "action": "JIRA_CREATE_ISSUE", "connection_id": "c-jira",
                     "input_template": {"summary": "{{ inputs.subject }}"},
                     "output_vars": {"issue_id": "id"},
                     "on_error": [
                        {"kind": "action", "id": "escalate", "tool": "slack",
                         "action": "SLACK_SEND_MESSAGE", "connection_id": "c-slack",
                         "input_template": {"channel": "#oncall", "text": "filing failed"}},
                     ]},
                ]}],
                "else_steps": [],
            },
            {
                "kind": "switch", "id": "by_team", "selector": "globals.team",
                "cases": [
                    {"value": "platform", "steps": [
                        {"kind": "action", "id": "notify_platform", "tool": "slack",
                         "action": "SLACK_SEND_MESSAGE", "connection_id": "c-slack",
                         "input_template": {"channel": "#platform", "text": "hi"}},
                    ]},
                ],
                "default_steps": [],
            },
            {
                "kind": "parallel", "id": "fanout", "join_mode": "quorum:1",
                "branches": [
                    [{"kind": "action", "id": "ping_a", "tool": "slack",
                      "action": "SLACK_SEND_MESSAGE", "connection_id": "c-slack",
                      "input_template": {"channel": "#a", "text": "a"}}],
                    [{"kind": "action", "id": "ping_b", "tool": "slack",
                      "action": "SLACK_SEND_MESSAGE", "connection_id": "c-slack",
                      "input_template": {"channel": "#b", "text": "b"}}],
                ],
            },
            {
                "kind": "while", "id": "poll", "condition": "vars.loop_iteration < 2",
                "max_iterations": 5,
                "body": [{"kind": "action", "id": "check", "tool": "slack",
                          "action": "SLACK_SEND_MESSAGE", "connection_id": "c-slack",
                          "input_template": {"channel": "#x", "text": "{{ vars.loop_iteration }}"}}],
            },
            {
                "kind": "foreach", "id": "per_item", "source": "inputs.items",
                "max_concurrency": 3,
                "body": [{"kind": "action", "id": "handle", "tool": "slack",
                          "action": "SLACK_SEND_MESSAGE", "connection_id": "c-slack",
                          "input_template": {"channel": "#y", "text": "{{ vars.item }}"}}],
            },
        ],
    })
}

#[test]
fn compiled_dags_always_revalidate_clean() {
    let catalog = catalog();
    let ctx = LintContext { catalog: &catalog, connections: None };

    let outcome = validate_and_compile(&kitchen_sink(), &ctx);
    assert!(outcome.ok, "errors: {:?}", outcome.errors);
    let dag = outcome.dag.unwrap();

    let dag_value = serde_json::to_value(&dag).unwrap();
    let response = validate(Stage::Dag, &dag_value, &ctx, ValidateOptions::default());
    assert!(response.ok, "dag revalidation failed: {:?}", response.errors);

    // Spot-check the lowering: every construct produced its node.
    for id in ["mail", "triage", "triage_join", "by_team", "by_team_join",
               "fanout", "fanout_join", "poll", "per_item"] {
        assert!(dag.node(id).is_some(), "missing node {id}");
    }
}

#[test]
fn compilation_is_idempotent() {
    let catalog = catalog();
    let ctx = LintContext { catalog: &catalog, connections: None };
    let a = validate_and_compile(&kitchen_sink(), &ctx);
    let b = validate_and_compile(&kitchen_sink(), &ctx);
    assert_eq!(
        serde_json::to_value(a.dag.unwrap()).unwrap(),
        serde_json::to_value(b.dag.unwrap()).unwrap(),
    );
}

#[test]
fn template_stage_is_lenient_but_rejects_unknown_kinds() {
    let catalog = catalog();
    let ctx = LintContext { catalog: &catalog, connections: None };

    let sketch = json!({
        "triggers": [{"kind": "event_based", "toolkit_slug": "{{provider}}"}],
        "steps": [{"kind": "action", "tool": "{{tool}}", "action": "{{action}}"}],
    });
    assert!(validate(Stage::Template, &sketch, &ctx, ValidateOptions::default()).ok);

    let bogus = json!({"steps": [{"kind": "subroutine"}]});
    let response = validate(Stage::Template, &bogus, &ctx, ValidateOptions::default());
    assert!(!response.ok);
}

#[test]
fn repairs_clear_their_findings_and_compile_proceeds() {
    let catalog = catalog();
    let ctx = LintContext { catalog: &catalog, connections: None };

    let mut doc = kitchen_sink();
    doc["triggers"][0]["verify_signature"] = json!(false);
    doc["steps"][1]["cases"][0]["steps"][0]["input_template"]["text"] =
        json!("ghp_abcdef0123456789");

    // Secret-shaped literal plus unverified webhook: both repairable.
    let report = lint(Stage::Executable, &doc, &ctx, LintOptions::default());
    assert!(report.errors.iter().any(|f| f.code == "E012"));
    assert!(report.errors.iter().any(|f| f.code == "E013"));

    let outcome = validate_and_compile(&doc, &ctx);
    assert!(outcome.ok, "errors: {:?}", outcome.errors);
    assert!(outcome.repairs.iter().any(|r| r.rule_code == "E012"));
    assert!(outcome.repairs.iter().any(|r| r.rule_code == "E013"));

    let dag = outcome.dag.unwrap();
    let (_, trigger) = dag.trigger_nodes().next().unwrap();
    assert!(trigger.verify_signature);
}

#[test]
fn unknown_catalog_entries_block_compilation() {
    let catalog = catalog();
    let ctx = LintContext { catalog: &catalog, connections: None };
    let mut doc = kitchen_sink();
    doc["steps"][1]["cases"][0]["steps"][0]["tool"] = json!("pagerduty");
    let outcome = validate_and_compile(&doc, &ctx);
    assert!(!outcome.ok);
    assert!(outcome.errors.iter().any(|e| e.code == "E001"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Lowering a linear chain of N actions is deterministic and produces
    /// N+1 nodes and N edges regardless of the ids chosen.
    #[test]
    fn linear_lowering_shape_holds(
        ids in proptest::collection::vec("[a-z][a-z0-9_]{0,12}", 1..8)
    ) {
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        prop_assume!(unique.len() == ids.len());

        let steps: Vec<Value> = ids.iter().map(|id| json!({
            "kind": "action", "id": id, "tool": "slack",
            "action": "SLACK_SEND_MESSAGE", "connection_id": "c",
            "input_template": {"channel": "#x", "text": id},
        })).collect();
        let doc = json!({
            "workflow_id": "wf-prop",
            "version": 1,
            "user_id": "u",
            "triggers": [{
                "id": "trig", "kind": "event_based", "toolkit_slug": "gmail",
                "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c1",
                "filter": {}, "verify_signature": true,
            }],
            "steps": steps,
        });
        prop_assume!(!ids.contains(&"trig".to_string()));

        let dag_a = weave::validator::compile_value(&doc).unwrap();
        let dag_b = weave::validator::compile_value(&doc).unwrap();
        prop_assert_eq!(
            serde_json::to_value(&dag_a).unwrap(),
            serde_json::to_value(&dag_b).unwrap()
        );
        prop_assert_eq!(dag_a.nodes.len(), ids.len() + 1);
        prop_assert_eq!(dag_a.edges.len(), ids.len());
    }
}
