//! Deterministic lowering from executable documents to DAGs.
//!
//! The lowering is purely structural: node ids come from the document,
//! reconvergence joins and edge ids are derived in traversal order, and the
//! same input always produces byte-identical output.

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::dag::{
    ActionData, Dag, DagError, Edge, EdgeWhen, GatewayIfData, GatewaySwitchData, Globals, IfBranch,
    JoinData, JoinMode, LoopForeachData, LoopWhileData, Node, NodeData, ParallelData, SwitchCase,
    TriggerData, TriggerDelivery, TriggerKind,
};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("executable document does not parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("step '{0}' requires a non-empty body")]
    EmptyBody(String),

    #[error("compiled graph failed integrity checks: {0}")]
    Graph(#[from] DagError),
}

// ---------------------------------------------------------------------------
// Executable document model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutableDoc {
    pub workflow_id: String,
    pub version: u32,
    pub user_id: String,
    #[serde(default)]
    pub globals: Option<Globals>,
    pub triggers: Vec<TriggerDecl>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerDecl {
    pub id: String,
    pub kind: TriggerKind,
    pub toolkit_slug: String,
    #[serde(default)]
    pub composio_trigger_slug: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub delivery: TriggerDelivery,
    #[serde(default)]
    pub verify_signature: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Action {
        id: String,
        tool: String,
        action: String,
        connection_id: String,
        input_template: Value,
        #[serde(default)]
        output_vars: Option<std::collections::BTreeMap<String, String>>,
        #[serde(default)]
        retry: Option<RetryPolicy>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        on_error: Vec<Step>,
    },
    If {
        id: String,
        branches: Vec<IfBranchDecl>,
        #[serde(default)]
        else_steps: Vec<Step>,
    },
    Switch {
        id: String,
        selector: String,
        cases: Vec<CaseDecl>,
        #[serde(default)]
        default_steps: Option<Vec<Step>>,
    },
    Parallel {
        id: String,
        branches: Vec<Branch>,
        #[serde(default = "default_join_mode")]
        join_mode: JoinMode,
    },
    While {
        id: String,
        condition: String,
        max_iterations: u64,
        body: Vec<Step>,
    },
    Foreach {
        id: String,
        source: String,
        max_concurrency: usize,
        body: Vec<Step>,
    },
}

impl Step {
    fn id(&self) -> &str {
        match self {
            Step::Action { id, .. }
            | Step::If { id, .. }
            | Step::Switch { id, .. }
            | Step::Parallel { id, .. }
            | Step::While { id, .. }
            | Step::Foreach { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IfBranchDecl {
    pub expr: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaseDecl {
    pub value: Value,
    pub steps: Vec<Step>,
}

/// Parallel branches are bare step lists.
pub type Branch = Vec<Step>;

fn default_join_mode() -> JoinMode {
    JoinMode::All
}

/// Deterministic trigger identity: routes event deliveries to this node.
pub fn trigger_instance_id(user_id: &str, workflow_id: &str, version: u32, node_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(workflow_id.as_bytes());
    hasher.update(version.to_string().as_bytes());
    hasher.update(node_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

/// Parse a raw executable document and lower it.
pub fn compile_value(doc: &Value) -> Result<Dag, CompileError> {
    let parsed: ExecutableDoc = serde_json::from_value(doc.clone())?;
    compile_executable(&parsed)
}

pub fn compile_executable(doc: &ExecutableDoc) -> Result<Dag, CompileError> {
    let mut lowering = Lowering {
        doc,
        nodes: Vec::new(),
        edges: Vec::new(),
        edge_seq: 0,
    };

    let mut tails: Vec<(String, EdgeWhen)> = Vec::new();
    for trigger in &doc.triggers {
        lowering.nodes.push(Node {
            id: trigger.id.clone(),
            data: NodeData::Trigger(TriggerData {
                kind: trigger.kind,
                toolkit_slug: trigger.toolkit_slug.clone(),
                composio_trigger_slug: trigger.composio_trigger_slug.clone(),
                connection_id: trigger.connection_id.clone(),
                filter: trigger.filter.clone(),
                cron_expr: trigger.cron_expr.clone(),
                timezone: trigger.timezone.clone(),
                delivery: trigger.delivery,
                verify_signature: trigger.verify_signature,
                trigger_instance_id: Some(trigger_instance_id(
                    &doc.user_id,
                    &doc.workflow_id,
                    doc.version,
                    &trigger.id,
                )),
            }),
        });
        tails.push((trigger.id.clone(), EdgeWhen::Always));
    }

    lowering.emit_steps(&doc.steps, tails)?;

    let dag = Dag {
        workflow_id: doc.workflow_id.clone(),
        version: doc.version,
        nodes: lowering.nodes,
        edges: lowering.edges,
        globals: doc.globals.clone(),
    };
    dag.index()?;
    Ok(dag)
}

struct Lowering<'a> {
    doc: &'a ExecutableDoc,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    edge_seq: usize,
}

impl Lowering<'_> {
    fn add_edge(&mut self, source: &str, target: &str, when: EdgeWhen) {
        self.edge_seq += 1;
        self.edges.push(Edge {
            id: format!("e{}", self.edge_seq),
            source: source.to_string(),
            target: target.to_string(),
            when,
            condition: None,
        });
    }

    fn connect(&mut self, tails: &[(String, EdgeWhen)], target: &str) {
        for (source, when) in tails {
            self.add_edge(source, target, *when);
        }
    }

    /// Emit a step sequence; returns the new tails.
    fn emit_steps(
        &mut self,
        steps: &[Step],
        mut tails: Vec<(String, EdgeWhen)>,
    ) -> Result<Vec<(String, EdgeWhen)>, CompileError> {
        for step in steps {
            tails = self.emit_step(step, tails)?;
        }
        Ok(tails)
    }

    fn emit_step(
        &mut self,
        step: &Step,
        tails: Vec<(String, EdgeWhen)>,
    ) -> Result<Vec<(String, EdgeWhen)>, CompileError> {
        match step {
            Step::Action {
                id,
                tool,
                action,
                connection_id,
                input_template,
                output_vars,
                retry,
                timeout_ms,
                on_error,
            } => {
                let globals = self.doc.globals.as_ref();
                self.nodes.push(Node {
                    id: id.clone(),
                    data: NodeData::Action(ActionData {
                        tool: tool.clone(),
                        action: action.clone(),
                        connection_id: connection_id.clone(),
                        input_template: input_template.clone(),
                        output_vars: output_vars.clone(),
                        // Inherit run-wide defaults at compile time.
                        retry: retry.or(globals.and_then(|g| g.retry)),
                        timeout_ms: timeout_ms.or(globals.and_then(|g| g.timeout_ms)),
                    }),
                });
                self.connect(&tails, id);

                if !on_error.is_empty() {
                    // Error branch: entered via when=error, never rejoins.
                    let entry = vec![(id.clone(), EdgeWhen::Error)];
                    self.emit_steps(on_error, entry)?;
                }

                Ok(vec![(id.clone(), EdgeWhen::Always)])
            }

            Step::If {
                id,
                branches,
                else_steps,
            } => {
                let join_id = format!("{id}_join");
                let mut lowered_branches = Vec::with_capacity(branches.len());
                let mut needs_gateway_join_edge = false;

                self.nodes.push(Node {
                    id: id.clone(),
                    // Placeholder; replaced once branch entries are known.
                    data: NodeData::GatewayIf(GatewayIfData {
                        branches: Vec::new(),
                        else_to: None,
                    }),
                });
                let gateway_index = self.nodes.len() - 1;
                self.connect(&tails, id);

                for branch in branches {
                    let to = match branch.steps.first() {
                        Some(first) => first.id().to_string(),
                        None => {
                            needs_gateway_join_edge = true;
                            join_id.clone()
                        }
                    };
                    lowered_branches.push(IfBranch {
                        expr: branch.expr.clone(),
                        to,
                    });
                    let entry = vec![(id.clone(), EdgeWhen::Always)];
                    let branch_tails = self.emit_steps(&branch.steps, entry)?;
                    if !branch.steps.is_empty() {
                        self.connect(&branch_tails, &join_id);
                    }
                }

                let else_to = match else_steps.first() {
                    Some(first) => {
                        let entry = vec![(id.clone(), EdgeWhen::Always)];
                        let else_tails = self.emit_steps(else_steps, entry)?;
                        self.connect(&else_tails, &join_id);
                        Some(first.id().to_string())
                    }
                    None => {
                        needs_gateway_join_edge = true;
                        Some(join_id.clone())
                    }
                };

                if needs_gateway_join_edge {
                    self.add_edge(id, &join_id, EdgeWhen::Always);
                }
                self.nodes[gateway_index].data = NodeData::GatewayIf(GatewayIfData {
                    branches: lowered_branches,
                    else_to,
                });

                // Gateways are exclusive, so the reconvergence join fires on
                // the first arrival.
                self.nodes.push(Node {
                    id: join_id.clone(),
                    data: NodeData::Join(JoinData { mode: JoinMode::Any }),
                });
                Ok(vec![(join_id, EdgeWhen::Always)])
            }

            Step::Switch {
                id,
                selector,
                cases,
                default_steps,
            } => {
                let join_id = format!("{id}_join");
                let mut lowered_cases = Vec::with_capacity(cases.len());
                let mut needs_gateway_join_edge = false;

                self.nodes.push(Node {
                    id: id.clone(),
                    data: NodeData::GatewaySwitch(GatewaySwitchData {
                        selector: selector.clone(),
                        cases: Vec::new(),
                        default_to: None,
                    }),
                });
                let gateway_index = self.nodes.len() - 1;
                self.connect(&tails, id);

                for case in cases {
                    let to = match case.steps.first() {
                        Some(first) => first.id().to_string(),
                        None => {
                            needs_gateway_join_edge = true;
                            join_id.clone()
                        }
                    };
                    lowered_cases.push(SwitchCase {
                        value: case.value.clone(),
                        to,
                    });
                    let entry = vec![(id.clone(), EdgeWhen::Always)];
                    let case_tails = self.emit_steps(&case.steps, entry)?;
                    if !case.steps.is_empty() {
                        self.connect(&case_tails, &join_id);
                    }
                }

                let default_to = match default_steps {
                    Some(steps) if !steps.is_empty() => {
                        let entry = vec![(id.clone(), EdgeWhen::Always)];
                        let default_tails = self.emit_steps(steps, entry)?;
                        self.connect(&default_tails, &join_id);
                        Some(steps[0].id().to_string())
                    }
                    _ => {
                        needs_gateway_join_edge = true;
                        Some(join_id.clone())
                    }
                };

                if needs_gateway_join_edge {
                    self.add_edge(id, &join_id, EdgeWhen::Always);
                }
                self.nodes[gateway_index].data = NodeData::GatewaySwitch(GatewaySwitchData {
                    selector: selector.clone(),
                    cases: lowered_cases,
                    default_to,
                });

                self.nodes.push(Node {
                    id: join_id.clone(),
                    data: NodeData::Join(JoinData { mode: JoinMode::Any }),
                });
                Ok(vec![(join_id, EdgeWhen::Always)])
            }

            Step::Parallel {
                id,
                branches,
                join_mode,
            } => {
                let join_id = format!("{id}_join");
                self.nodes.push(Node {
                    id: id.clone(),
                    data: NodeData::Parallel(ParallelData {}),
                });
                self.connect(&tails, id);

                for branch in branches {
                    if branch.is_empty() {
                        self.add_edge(id, &join_id, EdgeWhen::Always);
                        continue;
                    }
                    let entry = vec![(id.clone(), EdgeWhen::Always)];
                    let branch_tails = self.emit_steps(branch, entry)?;
                    self.connect(&branch_tails, &join_id);
                }

                self.nodes.push(Node {
                    id: join_id.clone(),
                    data: NodeData::Join(JoinData { mode: *join_mode }),
                });
                Ok(vec![(join_id, EdgeWhen::Always)])
            }

            Step::While {
                id,
                condition,
                max_iterations,
                body,
            } => {
                let body_start = body
                    .first()
                    .map(|s| s.id().to_string())
                    .ok_or_else(|| CompileError::EmptyBody(id.clone()))?;
                self.nodes.push(Node {
                    id: id.clone(),
                    data: NodeData::LoopWhile(LoopWhileData {
                        condition: condition.clone(),
                        body_start,
                        max_iterations: *max_iterations,
                    }),
                });
                self.connect(&tails, id);

                let entry = vec![(id.clone(), EdgeWhen::Always)];
                let body_tails = self.emit_steps(body, entry)?;
                // Back edge: the body terminal re-enters the loop head.
                self.connect(&body_tails, id);

                Ok(vec![(id.clone(), EdgeWhen::Always)])
            }

            Step::Foreach {
                id,
                source,
                max_concurrency,
                body,
            } => {
                let body_start = body
                    .first()
                    .map(|s| s.id().to_string())
                    .ok_or_else(|| CompileError::EmptyBody(id.clone()))?;
                self.nodes.push(Node {
                    id: id.clone(),
                    data: NodeData::LoopForeach(LoopForeachData {
                        source_array_expr: source.clone(),
                        body_start,
                        max_concurrency: *max_concurrency,
                    }),
                });
                self.connect(&tails, id);

                // Shards run the body subgraph internally; the terminal has
                // no outgoing edge.
                let entry = vec![(id.clone(), EdgeWhen::Always)];
                self.emit_steps(body, entry)?;

                Ok(vec![(id.clone(), EdgeWhen::Always)])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_doc() -> Value {
        json!({
            "workflow_id": "wf-linear",
            "version": 1,
            "user_id": "u1",
            "triggers": [{
                "id": "t1", "kind": "event_based", "toolkit_slug": "gmail",
                "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c1",
                "verify_signature": true,
            }],
            "steps": [
                {"kind": "action", "id": "a1", "tool": "slack", "action": "SLACK_SEND",
                 "connection_id": "c2", "input_template": {"text": "one"}},
                {"kind": "action", "id": "a2", "tool": "slack", "action": "SLACK_SEND",
                 "connection_id": "c2", "input_template": {"text": "two"}},
            ],
        })
    }

    #[test]
    fn lowers_linear_chain() {
        let dag = compile_value(&linear_doc()).unwrap();
        assert_eq!(dag.nodes.len(), 3);
        assert_eq!(dag.edges.len(), 2);
        assert_eq!(dag.edges[0].source, "t1");
        assert_eq!(dag.edges[0].target, "a1");
        assert_eq!(dag.edges[1].source, "a1");
        assert_eq!(dag.edges[1].target, "a2");
    }

    #[test]
    fn compilation_is_deterministic() {
        let doc = linear_doc();
        let a = serde_json::to_string(&compile_value(&doc).unwrap()).unwrap();
        let b = serde_json::to_string(&compile_value(&doc).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn trigger_instance_ids_are_stable() {
        let dag = compile_value(&linear_doc()).unwrap();
        let (_, trigger) = dag.trigger_nodes().next().unwrap();
        assert_eq!(
            trigger.trigger_instance_id.as_deref(),
            Some(trigger_instance_id("u1", "wf-linear", 1, "t1").as_str())
        );
    }

    #[test]
    fn actions_inherit_global_retry_and_timeout() {
        let mut doc = linear_doc();
        doc["globals"] = json!({
            "retry": {"retries": 4, "backoff": "exponential", "delay_ms": 250},
            "timeout_ms": 9_000,
        });
        let dag = compile_value(&doc).unwrap();
        let NodeData::Action(action) = &dag.node("a1").unwrap().data else {
            panic!("expected action");
        };
        assert_eq!(action.retry.unwrap().retries, 4);
        assert_eq!(action.timeout_ms, Some(9_000));
    }

    #[test]
    fn lowers_if_with_reconvergence_join() {
        let doc = json!({
            "workflow_id": "wf-if",
            "version": 1,
            "user_id": "u1",
            "triggers": [{
                "id": "t1", "kind": "event_based", "toolkit_slug": "gmail",
                "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c1",
            }],
            "steps": [{
                "kind": "if", "id": "g1",
                "branches": [{"expr": "inputs.urgent == true", "steps": [
                    {"kind": "action", "id": "page", "tool": "pagerduty", "action": "PD_PAGE",
                     "connection_id": "c3", "input_template": {}},
                ]}],
            }],
        });
        let dag = compile_value(&doc).unwrap();

        let NodeData::GatewayIf(gateway) = &dag.node("g1").unwrap().data else {
            panic!("expected gateway");
        };
        assert_eq!(gateway.branches[0].to, "page");
        assert_eq!(gateway.else_to.as_deref(), Some("g1_join"));

        let NodeData::Join(join) = &dag.node("g1_join").unwrap().data else {
            panic!("expected join");
        };
        assert_eq!(join.mode, JoinMode::Any);

        // else path: direct gateway -> join edge exists.
        assert!(dag
            .edges
            .iter()
            .any(|e| e.source == "g1" && e.target == "g1_join"));
    }

    #[test]
    fn lowers_parallel_with_declared_join_mode() {
        let doc = json!({
            "workflow_id": "wf-par",
            "version": 1,
            "user_id": "u1",
            "triggers": [{
                "id": "t1", "kind": "event_based", "toolkit_slug": "gmail",
                "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c1",
            }],
            "steps": [{
                "kind": "parallel", "id": "p1", "join_mode": "quorum:1",
                "branches": [
                    [{"kind": "action", "id": "b1", "tool": "x", "action": "A",
                      "connection_id": "c", "input_template": {}}],
                    [{"kind": "action", "id": "b2", "tool": "x", "action": "B",
                      "connection_id": "c", "input_template": {}}],
                ],
            }],
        });
        let dag = compile_value(&doc).unwrap();
        let NodeData::Join(join) = &dag.node("p1_join").unwrap().data else {
            panic!("expected join");
        };
        assert_eq!(join.mode, JoinMode::Quorum(1));
        let index = dag.index().unwrap();
        assert_eq!(index.in_degree("p1_join"), 2);
    }

    #[test]
    fn lowers_while_with_back_edge() {
        let doc = json!({
            "workflow_id": "wf-loop",
            "version": 1,
            "user_id": "u1",
            "triggers": [{
                "id": "t1", "kind": "event_based", "toolkit_slug": "gmail",
                "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c1",
            }],
            "steps": [
                {"kind": "while", "id": "w1", "condition": "vars.more == true",
                 "max_iterations": 5, "body": [
                    {"kind": "action", "id": "fetch", "tool": "x", "action": "F",
                     "connection_id": "c", "input_template": {}},
                ]},
                {"kind": "action", "id": "done", "tool": "x", "action": "D",
                 "connection_id": "c", "input_template": {}},
            ],
        });
        let dag = compile_value(&doc).unwrap();
        assert!(dag.edges.iter().any(|e| e.source == "fetch" && e.target == "w1"));
        assert!(dag.edges.iter().any(|e| e.source == "w1" && e.target == "done"));
        let index = dag.index().unwrap();
        assert!(index.loop_body("w1").unwrap().contains("fetch"));
    }

    #[test]
    fn on_error_steps_enter_via_error_edge() {
        let doc = json!({
            "workflow_id": "wf-err",
            "version": 1,
            "user_id": "u1",
            "triggers": [{
                "id": "t1", "kind": "event_based", "toolkit_slug": "gmail",
                "composio_trigger_slug": "GMAIL_NEW_MESSAGE", "connection_id": "c1",
            }],
            "steps": [
                {"kind": "action", "id": "risky", "tool": "x", "action": "R",
                 "connection_id": "c", "input_template": {},
                 "on_error": [
                    {"kind": "action", "id": "notify", "tool": "slack", "action": "S",
                     "connection_id": "c", "input_template": {}},
                 ]},
            ],
        });
        let dag = compile_value(&doc).unwrap();
        let edge = dag
            .edges
            .iter()
            .find(|e| e.source == "risky" && e.target == "notify")
            .unwrap();
        assert_eq!(edge.when, EdgeWhen::Error);
    }
}
