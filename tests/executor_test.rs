//! End-to-end executor scenarios over compiled DAGs, with in-memory stores
//! and a scripted invoker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use weave::catalog::InMemoryCatalog;
use weave::dag::Dag;
use weave::executor::{Executor, ExecutorConfig};
use weave::idempotency::{action_idem_key, IdempotencyCache};
use weave::run_state::{NodeExecution, NodeStatus, RunSource, RunStatus, WorkflowRun};
use weave::store::{MemoryRunStore, MemoryWorkflowStore, RunStore, WorkflowStore};
use weave::test_support::MockInvoker;
use weave::validator::{validate_and_compile, LintContext};

struct Harness {
    workflows: Arc<MemoryWorkflowStore>,
    runs: Arc<MemoryRunStore>,
    invoker: Arc<MockInvoker>,
    cache: Arc<IdempotencyCache>,
    executor: Executor,
}

fn harness() -> Harness {
    let workflows = Arc::new(MemoryWorkflowStore::new());
    let runs = Arc::new(MemoryRunStore::new());
    let invoker = Arc::new(MockInvoker::new());
    let cache = Arc::new(IdempotencyCache::new(Duration::from_secs(86_400)));
    let executor = Executor::new(
        Arc::clone(&workflows) as Arc<dyn weave::store::WorkflowStore>,
        Arc::clone(&runs) as Arc<dyn RunStore>,
        Arc::clone(&invoker) as Arc<dyn weave::invoker::ToolInvoker>,
        Arc::clone(&cache),
        ExecutorConfig::default(),
    );
    Harness {
        workflows,
        runs,
        invoker,
        cache,
        executor,
    }
}

fn compile(doc: Value) -> Dag {
    let catalog = InMemoryCatalog::new();
    let ctx = LintContext {
        catalog: &catalog,
        connections: None,
    };
    let outcome = validate_and_compile(&doc, &ctx);
    assert!(outcome.ok, "compile failed: {:?}", outcome.errors);
    outcome.dag.unwrap()
}

fn base_doc(steps: Value) -> Value {
    json!({
        "workflow_id": "wf-test",
        "version": 1,
        "user_id": "u1",
        "triggers": [{
            "id": "t1", "kind": "event_based", "toolkit_slug": "gmail",
            "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c1",
            "filter": {"label": "INBOX"}, "verify_signature": true,
        }],
        "steps": steps,
    })
}

fn action(id: &str, action: &str, template: Value) -> Value {
    json!({
        "kind": "action", "id": id, "tool": "svc", "action": action,
        "connection_id": "c2", "input_template": template,
        "retry": {"retries": 0, "backoff": "linear", "delay_ms": 10},
    })
}

async fn statuses(runs: &MemoryRunStore, run_id: Uuid) -> HashMap<String, NodeStatus> {
    let executions = runs.node_executions(run_id).await.unwrap();
    weave::store::current_attempts(&executions)
        .into_iter()
        .map(|(id, e)| (id, e.status))
        .collect()
}

#[tokio::test]
async fn trivial_linear_run_succeeds() {
    let h = harness();
    let dag = Arc::new(compile(base_doc(json!([
        action("a1", "SVC_CREATE", json!({"name": "x"})),
        action("a2", "SVC_CONFIRM", json!({"target": "x"})),
    ]))));

    h.invoker.push_ok("SVC_CREATE", json!({"id": "x"}));
    h.invoker.push_ok("SVC_CONFIRM", json!({"ok": true}));

    let run_id = h
        .executor
        .start(Arc::clone(&dag), "t1", json!({"subject": "hi"}), RunSource::Manual, "u1")
        .await
        .unwrap();

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.finished_at.is_some());

    let statuses = statuses(&h.runs, run_id).await;
    assert_eq!(statuses["t1"], NodeStatus::Skipped);
    assert_eq!(statuses["a1"], NodeStatus::Done);
    assert_eq!(statuses["a2"], NodeStatus::Done);

    let calls = h.invoker.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].idempotency_key, calls[1].idempotency_key);

    let executions = h.runs.node_executions(run_id).await.unwrap();
    let a1 = executions
        .iter()
        .find(|e| e.node_id == "a1" && e.status == NodeStatus::Done)
        .unwrap();
    assert_eq!(a1.output_ref, Some(json!({"id": "x"})));
}

#[tokio::test]
async fn retriable_failures_are_retried_then_recover() {
    let h = harness();
    let doc = base_doc(json!([{
        "kind": "action", "id": "a1", "tool": "svc", "action": "SVC_FLAKY",
        "connection_id": "c2", "input_template": {"q": 1},
        "retry": {"retries": 2, "backoff": "linear", "delay_ms": 10},
    }]));
    let dag = Arc::new(compile(doc));

    h.invoker.push_retriable("SVC_FLAKY", "503");
    h.invoker.push_retriable("SVC_FLAKY", "503 again");
    h.invoker.push_ok("SVC_FLAKY", json!({"ok": true}));

    let started = std::time::Instant::now();
    let run_id = h
        .executor
        .start(dag, "t1", json!({}), RunSource::Manual, "u1")
        .await
        .unwrap();
    // Linear backoff: 10ms after attempt 1, 20ms after attempt 2.
    assert!(started.elapsed() >= Duration::from_millis(30));

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.invoker.calls_for("SVC_FLAKY"), 3);

    let executions = h.runs.node_executions(run_id).await.unwrap();
    let attempts: Vec<u32> = executions
        .iter()
        .filter(|e| e.node_id == "a1")
        .map(|e| e.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    let last = executions
        .iter()
        .find(|e| e.node_id == "a1" && e.attempt == 3)
        .unwrap();
    assert_eq!(last.status, NodeStatus::Done);
}

#[tokio::test]
async fn zero_retries_surface_the_first_retriable_failure() {
    let h = harness();
    let dag = Arc::new(compile(base_doc(json!([
        action("a1", "SVC_ONCE", json!({"q": 1})),
    ]))));
    h.invoker.push_retriable("SVC_ONCE", "503");

    let run_id = h
        .executor
        .start(dag, "t1", json!({}), RunSource::Manual, "u1")
        .await
        .unwrap();

    assert_eq!(h.invoker.calls_for("SVC_ONCE"), 1);
    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let statuses = statuses(&h.runs, run_id).await;
    assert_eq!(statuses["a1"], NodeStatus::Error);
}

#[tokio::test]
async fn takeover_replays_cached_result_without_invoking() {
    let h = harness();
    let dag = compile(base_doc(json!([
        action("a1", "SVC_CREATE", json!({"name": "x"})),
    ])));
    h.workflows.save_dag(&dag).await.unwrap();

    // A previous owner got the result cached, persisted RUNNING, then died.
    let run_id = Uuid::new_v4();
    h.runs
        .create_run(&WorkflowRun {
            run_id,
            workflow_id: dag.workflow_id.clone(),
            version: dag.version,
            user_id: "u1".into(),
            status: RunStatus::Running,
            source: RunSource::Event,
            started_at: Utc::now(),
            finished_at: None,
            trigger_digest: "d".into(),
        })
        .await
        .unwrap();
    h.runs
        .upsert_node_execution(&NodeExecution {
            run_id,
            node_id: "t1".into(),
            attempt: 1,
            status: NodeStatus::Skipped,
            output_ref: None,
            error: None,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            idem_key: None,
        })
        .await
        .unwrap();
    let idem_key = action_idem_key(&run_id.to_string(), "a1", &json!({"name": "x"}));
    h.runs
        .upsert_node_execution(&NodeExecution {
            run_id,
            node_id: "a1".into(),
            attempt: 1,
            status: NodeStatus::Running,
            output_ref: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            idem_key: Some(idem_key.clone()),
        })
        .await
        .unwrap();
    h.cache.put(&idem_key, json!({"id": "x"}));

    h.executor.resume(run_id).await.unwrap();

    assert_eq!(h.invoker.call_count(), 0);
    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let executions = h.runs.node_executions(run_id).await.unwrap();
    let current = weave::store::current_attempts(&executions);
    assert_eq!(current["a1"].status, NodeStatus::Done);
    assert_eq!(current["a1"].output_ref, Some(json!({"id": "x"})));
}

#[tokio::test]
async fn parallel_join_all_deadlocks_when_a_branch_errors() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "parallel", "id": "p1", "join_mode": "all",
            "branches": [
                [action("b1", "SVC_B1", json!({"n": 1}))],
                [action("b2", "SVC_B2", json!({"n": 2}))],
            ],
        },
        action("a3", "SVC_AFTER", json!({})),
    ]));
    let dag = Arc::new(compile(doc));

    h.invoker.push_ok("SVC_B1", json!({"ok": true}));
    h.invoker.push_fatal("SVC_B2", "400 bad request");

    let run_id = h
        .executor
        .start(dag, "t1", json!({}), RunSource::Manual, "u1")
        .await
        .unwrap();

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let statuses = statuses(&h.runs, run_id).await;
    assert_eq!(statuses["b1"], NodeStatus::Done);
    assert_eq!(statuses["b2"], NodeStatus::Error);
    // The join can never be satisfied and the downstream action never ran.
    assert_eq!(statuses["p1_join"], NodeStatus::Error);
    assert_eq!(statuses["a3"], NodeStatus::Skipped);
    assert_eq!(h.invoker.calls_for("SVC_AFTER"), 0);
}

#[tokio::test]
async fn quorum_join_fires_on_nth_arrival() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "parallel", "id": "p1", "join_mode": "quorum:1",
            "branches": [
                [action("b1", "SVC_B1", json!({"n": 1}))],
                [action("b2", "SVC_B2", json!({"n": 2}))],
            ],
        },
        action("a3", "SVC_AFTER", json!({})),
    ]));
    let dag = Arc::new(compile(doc));

    h.invoker.push_ok("SVC_B1", json!({"ok": 1}));
    h.invoker.push_ok("SVC_B2", json!({"ok": 2}));
    h.invoker.push_ok("SVC_AFTER", json!({"done": true}));

    let run_id = h
        .executor
        .start(dag, "t1", json!({}), RunSource::Manual, "u1")
        .await
        .unwrap();

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let executions = h.runs.node_executions(run_id).await.unwrap();
    let join = weave::store::current_attempts(&executions)
        .remove("p1_join")
        .unwrap();
    assert_eq!(join.status, NodeStatus::Done);
    assert_eq!(join.output_ref, Some(json!({"arrived": 1})));
    assert_eq!(h.invoker.calls_for("SVC_AFTER"), 1);
}

#[tokio::test]
async fn gateway_if_routes_only_the_chosen_branch() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "if", "id": "g1",
            "branches": [
                {"expr": "inputs.urgent == true", "steps": [
                    action("page", "SVC_PAGE", json!({})),
                ]},
            ],
            "else_steps": [action("log", "SVC_LOG", json!({}))],
        },
        action("after", "SVC_AFTER", json!({})),
    ]));
    let dag = Arc::new(compile(doc));

    h.invoker.push_ok("SVC_LOG", json!({"logged": true}));
    h.invoker.push_ok("SVC_AFTER", json!({"ok": true}));

    let run_id = h
        .executor
        .start(dag, "t1", json!({"urgent": false}), RunSource::Manual, "u1")
        .await
        .unwrap();

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.invoker.calls_for("SVC_PAGE"), 0);
    assert_eq!(h.invoker.calls_for("SVC_LOG"), 1);
    assert_eq!(h.invoker.calls_for("SVC_AFTER"), 1);

    let statuses = statuses(&h.runs, run_id).await;
    assert_eq!(statuses["page"], NodeStatus::Skipped);
    assert_eq!(statuses["log"], NodeStatus::Done);
}

#[tokio::test]
async fn switch_uses_case_then_default() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "switch", "id": "s1", "selector": "inputs.kind",
            "cases": [
                {"value": "bug", "steps": [action("bug", "SVC_BUG", json!({}))]},
                {"value": "task", "steps": [action("task", "SVC_TASK", json!({}))]},
            ],
            "default_steps": [action("other", "SVC_OTHER", json!({}))],
        },
    ]));
    let dag = Arc::new(compile(doc));

    h.invoker.push_ok("SVC_BUG", json!({"filed": true}));
    let run_id = h
        .executor
        .start(Arc::clone(&dag), "t1", json!({"kind": "bug"}), RunSource::Manual, "u1")
        .await
        .unwrap();
    assert_eq!(h.invoker.calls_for("SVC_BUG"), 1);
    assert_eq!(h.invoker.calls_for("SVC_TASK"), 0);
    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);

    h.invoker.push_ok("SVC_OTHER", json!({"noted": true}));
    h.executor
        .start(dag, "t1", json!({"kind": "question"}), RunSource::Manual, "u1")
        .await
        .unwrap();
    assert_eq!(h.invoker.calls_for("SVC_OTHER"), 1);
}

#[tokio::test]
async fn while_loop_iterates_until_condition_clears() {
    let h = harness();
    let doc = json!({
        "workflow_id": "wf-loop",
        "version": 1,
        "user_id": "u1",
        "globals": {"vars": {}},
        "triggers": [{
            "id": "t1", "kind": "event_based", "toolkit_slug": "gmail",
            "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c1",
            "filter": {}, "verify_signature": true,
        }],
        "steps": [
            {
                "kind": "action", "id": "seed", "tool": "svc", "action": "SVC_SEED",
                "connection_id": "c2", "input_template": {},
                "output_vars": {"more": "more"},
                "retry": {"retries": 0, "backoff": "linear", "delay_ms": 1},
            },
            {
                "kind": "while", "id": "w1", "condition": "vars.more == true",
                "max_iterations": 10,
                "body": [{
                    "kind": "action", "id": "fetch", "tool": "svc", "action": "SVC_FETCH",
                    "connection_id": "c2",
                    "input_template": {"page": "{{ vars.loop_iteration }}"},
                    "output_vars": {"more": "more"},
                    "retry": {"retries": 0, "backoff": "linear", "delay_ms": 1},
                }],
            },
            {
                "kind": "action", "id": "done", "tool": "svc", "action": "SVC_DONE",
                "connection_id": "c2", "input_template": {},
                "retry": {"retries": 0, "backoff": "linear", "delay_ms": 1},
            },
        ],
    });
    let dag = Arc::new(compile(doc));

    h.invoker.push_ok("SVC_SEED", json!({"more": true}));
    h.invoker.push_ok("SVC_FETCH", json!({"more": true}));
    h.invoker.push_ok("SVC_FETCH", json!({"more": false}));
    h.invoker.push_ok("SVC_DONE", json!({"ok": true}));

    let run_id = h
        .executor
        .start(dag, "t1", json!({}), RunSource::Manual, "u1")
        .await
        .unwrap();

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.invoker.calls_for("SVC_FETCH"), 2);
    assert_eq!(h.invoker.calls_for("SVC_DONE"), 1);

    let executions = h.runs.node_executions(run_id).await.unwrap();
    let loop_exec = weave::store::current_attempts(&executions).remove("w1").unwrap();
    assert_eq!(loop_exec.status, NodeStatus::Done);
    assert_eq!(loop_exec.output_ref, Some(json!({"iterations": 2})));
}

#[tokio::test]
async fn while_loop_with_zero_budget_never_enters_the_body() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "while", "id": "w1", "condition": "inputs.go == true",
            "max_iterations": 0,
            "body": [action("never", "SVC_NEVER", json!({}))],
        },
        action("after", "SVC_AFTER", json!({})),
    ]));
    let dag = Arc::new(compile(doc));
    h.invoker.push_ok("SVC_AFTER", json!({}));

    let run_id = h
        .executor
        .start(dag, "t1", json!({"go": true}), RunSource::Manual, "u1")
        .await
        .unwrap();

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.invoker.calls_for("SVC_NEVER"), 0);
    let statuses = statuses(&h.runs, run_id).await;
    assert_eq!(statuses["w1"], NodeStatus::Done);
}

#[tokio::test]
async fn while_loop_fails_when_budget_is_exceeded() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "while", "id": "w1", "condition": "inputs.go == true",
            "max_iterations": 2,
            "body": [{
                "kind": "action", "id": "spin", "tool": "svc", "action": "SVC_SPIN",
                "connection_id": "c2",
                "input_template": {"i": "{{ vars.loop_iteration }}"},
                "retry": {"retries": 0, "backoff": "linear", "delay_ms": 1},
            }],
        },
    ]));
    let dag = Arc::new(compile(doc));
    h.invoker.push_ok("SVC_SPIN", json!({"i": 1}));
    h.invoker.push_ok("SVC_SPIN", json!({"i": 2}));

    let run_id = h
        .executor
        .start(dag, "t1", json!({"go": true}), RunSource::Manual, "u1")
        .await
        .unwrap();

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let statuses = statuses(&h.runs, run_id).await;
    assert_eq!(statuses["w1"], NodeStatus::Error);
    assert_eq!(h.invoker.calls_for("SVC_SPIN"), 2);
}

#[tokio::test]
async fn foreach_fans_out_and_reconverges() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "foreach", "id": "f1", "source": "inputs.items",
            "max_concurrency": 2,
            "body": [{
                "kind": "action", "id": "handle", "tool": "svc", "action": "SVC_HANDLE",
                "connection_id": "c2",
                "input_template": {"item": "{{ vars.item }}"},
                "retry": {"retries": 0, "backoff": "linear", "delay_ms": 1},
            }],
        },
        action("after", "SVC_AFTER", json!({})),
    ]));
    let dag = Arc::new(compile(doc));

    for i in 0..3 {
        h.invoker.push_ok("SVC_HANDLE", json!({"handled": i}));
    }
    h.invoker.push_ok("SVC_AFTER", json!({"ok": true}));

    let run_id = h
        .executor
        .start(
            dag,
            "t1",
            json!({"items": ["a", "b", "c"]}),
            RunSource::Manual,
            "u1",
        )
        .await
        .unwrap();

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.invoker.calls_for("SVC_HANDLE"), 3);
    assert_eq!(h.invoker.calls_for("SVC_AFTER"), 1);

    let executions = h.runs.node_executions(run_id).await.unwrap();
    // Shard executions are persisted under scoped ids.
    for shard in 0..3 {
        assert!(executions
            .iter()
            .any(|e| e.node_id == format!("handle:{shard}") && e.status == NodeStatus::Done));
    }
    let foreach = weave::store::current_attempts(&executions).remove("f1").unwrap();
    assert_eq!(foreach.status, NodeStatus::Done);
    let output = foreach.output_ref.unwrap();
    assert_eq!(output["items"], 3);
    assert_eq!(output["results"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn foreach_with_empty_source_skips_straight_through() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "foreach", "id": "f1", "source": "inputs.items",
            "max_concurrency": 4,
            "body": [action("handle", "SVC_HANDLE", json!({}))],
        },
        action("after", "SVC_AFTER", json!({})),
    ]));
    let dag = Arc::new(compile(doc));
    h.invoker.push_ok("SVC_AFTER", json!({"ok": true}));

    let run_id = h
        .executor
        .start(dag, "t1", json!({"items": []}), RunSource::Manual, "u1")
        .await
        .unwrap();

    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.invoker.calls_for("SVC_HANDLE"), 0);
    assert_eq!(h.invoker.calls_for("SVC_AFTER"), 1);
}

#[tokio::test]
async fn error_edges_handle_failures_and_keep_the_run_green() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "action", "id": "risky", "tool": "svc", "action": "SVC_RISKY",
            "connection_id": "c2", "input_template": {},
            "retry": {"retries": 0, "backoff": "linear", "delay_ms": 1},
            "on_error": [action("notify", "SVC_NOTIFY", json!({}))],
        },
    ]));
    let dag = Arc::new(compile(doc));

    h.invoker.push_fatal("SVC_RISKY", "422");
    h.invoker.push_ok("SVC_NOTIFY", json!({"sent": true}));

    let run_id = h
        .executor
        .start(dag, "t1", json!({}), RunSource::Manual, "u1")
        .await
        .unwrap();

    // The failure was routed, so it does not fail the run.
    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.invoker.calls_for("SVC_NOTIFY"), 1);
    let statuses = statuses(&h.runs, run_id).await;
    assert_eq!(statuses["risky"], NodeStatus::Error);
    assert_eq!(statuses["notify"], NodeStatus::Done);
}

#[tokio::test]
async fn event_deliveries_resolve_through_the_trigger_index() {
    let h = harness();
    let dag = compile(base_doc(json!([
        action("a1", "SVC_CREATE", json!({"name": "x"})),
    ])));
    h.workflows.save_dag(&dag).await.unwrap();
    let index = weave::triggers::TriggerIndex::build(&h.workflows.all_dags().await.unwrap());
    assert_eq!(index.len(), 1);

    h.invoker.push_ok("SVC_CREATE", json!({"id": "x"}));
    let hit = weave::triggers::EventDelivery {
        toolkit_slug: "gmail".into(),
        trigger_slug: "GMAIL_NEW_MESSAGE".into(),
        connection_id: "c1".into(),
        payload: json!({"label": "INBOX", "subject": "hi"}),
    };
    let run_id = h.executor.activate_event(&index, hit).await.unwrap().unwrap();
    let run = h.runs.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);

    // A delivery that fails the filter is discarded without a run.
    let miss = weave::triggers::EventDelivery {
        toolkit_slug: "gmail".into(),
        trigger_slug: "GMAIL_NEW_MESSAGE".into(),
        connection_id: "c1".into(),
        payload: json!({"label": "SPAM"}),
    };
    assert!(h.executor.activate_event(&index, miss).await.unwrap().is_none());
    assert_eq!(h.invoker.call_count(), 1);
}

#[tokio::test]
async fn output_vars_feed_downstream_templates() {
    let h = harness();
    let doc = base_doc(json!([
        {
            "kind": "action", "id": "create", "tool": "svc", "action": "SVC_CREATE",
            "connection_id": "c2", "input_template": {"name": "{{ inputs.name }}"},
            "output_vars": {"ticket_id": "id"},
            "retry": {"retries": 0, "backoff": "linear", "delay_ms": 1},
        },
        action("link", "SVC_LINK", json!({"ticket": "{{ vars.ticket_id }}"})),
    ]));
    let dag = Arc::new(compile(doc));

    h.invoker.push_ok("SVC_CREATE", json!({"id": "T-42"}));
    h.invoker.push_ok("SVC_LINK", json!({"ok": true}));

    h.executor
        .start(dag, "t1", json!({"name": "incident"}), RunSource::Manual, "u1")
        .await
        .unwrap();

    let calls = h.invoker.calls();
    assert_eq!(calls[0].arguments, json!({"name": "incident"}));
    assert_eq!(calls[1].arguments, json!({"ticket": "T-42"}));
}
