//! Workflow DAG document model.
//!
//! A [`Dag`] is an immutable, versioned JSON document of nodes and edges.
//! Cycles are representable only through the explicit loop nodes
//! (`loop_while`, `loop_foreach`); every other back edge is a validation
//! error. The dispatcher interprets loop semantics directly, so the
//! adjacency index built here excludes loop back edges from the acyclicity
//! check and precomputes each loop's body subgraph.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors raised while building the adjacency index.
#[derive(Debug, Error)]
pub enum DagError {
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("edge '{edge_id}' references unknown node '{node_id}'")]
    UnknownEndpoint { edge_id: String, node_id: String },

    #[error("loop node '{0}' body_start '{1}' does not exist")]
    UnknownBodyStart(String, String),

    #[error("cycle detected through node '{0}' outside any loop construct")]
    ImplicitCycle(String),
}

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

/// An immutable, versioned workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    pub workflow_id: String,
    pub version: u32,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub globals: Option<Globals>,
}

/// Run-wide defaults and the `globals` expression namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Globals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Deadline for the whole run; unset means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub vars: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub data: NodeData,
}

/// The closed set of node behaviors. Adding a variant is a deliberate,
/// schema-breaking change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeData {
    Trigger(TriggerData),
    Action(ActionData),
    GatewayIf(GatewayIfData),
    GatewaySwitch(GatewaySwitchData),
    Parallel(ParallelData),
    Join(JoinData),
    LoopWhile(LoopWhileData),
    LoopForeach(LoopForeachData),
}

impl NodeData {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeData::Trigger(_) => "trigger",
            NodeData::Action(_) => "action",
            NodeData::GatewayIf(_) => "gateway_if",
            NodeData::GatewaySwitch(_) => "gateway_switch",
            NodeData::Parallel(_) => "parallel",
            NodeData::Join(_) => "join",
            NodeData::LoopWhile(_) => "loop_while",
            NodeData::LoopForeach(_) => "loop_foreach",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    EventBased,
    ScheduleBased,
}

/// How an event-based trigger receives deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDelivery {
    #[default]
    Webhook,
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerData {
    pub kind: TriggerKind,
    pub toolkit_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composio_trigger_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub delivery: TriggerDelivery,
    #[serde(default)]
    pub verify_signature: bool,
    /// Deterministic identity assigned during compilation; routes incoming
    /// event deliveries to this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_instance_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionData {
    pub tool: String,
    pub action: String,
    pub connection_id: String,
    pub input_template: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_vars: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayIfData {
    pub branches: Vec<IfBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub else_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfBranch {
    pub expr: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySwitchData {
    pub selector: String,
    pub cases: Vec<SwitchCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: Value,
    pub to: String,
}

/// Fan-out marker; routing lives on the outgoing edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelData {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinData {
    pub mode: JoinMode,
}

/// Join synchronization mode, serialized as `"all"`, `"any"`, `"quorum:N"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    All,
    Any,
    Quorum(u32),
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinMode::All => write!(f, "all"),
            JoinMode::Any => write!(f, "any"),
            JoinMode::Quorum(n) => write!(f, "quorum:{n}"),
        }
    }
}

impl FromStr for JoinMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(JoinMode::All),
            "any" => Ok(JoinMode::Any),
            other => match other.strip_prefix("quorum:") {
                Some(n) => n
                    .parse::<u32>()
                    .map(JoinMode::Quorum)
                    .map_err(|_| format!("invalid quorum count in join mode '{other}'")),
                None => Err(format!("unknown join mode '{other}'")),
            },
        }
    }
}

impl Serialize for JoinMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for JoinMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopWhileData {
    pub condition: String,
    pub body_start: String,
    pub max_iterations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopForeachData {
    pub source_array_expr: String,
    pub body_start: String,
    pub max_concurrency: usize,
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Condition under which an edge routes relative to its source's final status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeWhen {
    #[default]
    Always,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub when: EdgeWhen,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

// ---------------------------------------------------------------------------
// Adjacency index
// ---------------------------------------------------------------------------

/// Precomputed adjacency for one [`Dag`], built once at load.
#[derive(Debug)]
pub struct DagIndex {
    node_by_id: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    /// Distinct-predecessor count per node (the join in-degree).
    in_degree: HashMap<String, usize>,
    /// Loop node id -> ids of every node in its body subgraph.
    loop_bodies: HashMap<String, HashSet<String>>,
}

impl Dag {
    /// Build the adjacency index, verifying graph integrity on the way.
    pub fn index(&self) -> Result<DagIndex, DagError> {
        let mut node_by_id = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if node_by_id.insert(node.id.clone(), i).is_some() {
                return Err(DagError::DuplicateNodeId(node.id.clone()));
            }
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            for endpoint in [&edge.source, &edge.target] {
                if !node_by_id.contains_key(endpoint) {
                    return Err(DagError::UnknownEndpoint {
                        edge_id: edge.id.clone(),
                        node_id: endpoint.clone(),
                    });
                }
            }
            outgoing.entry(edge.source.clone()).or_default().push(i);
            incoming.entry(edge.target.clone()).or_default().push(i);
        }

        let mut in_degree = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let distinct: HashSet<&str> = incoming
                .get(&node.id)
                .map(|edges| edges.iter().map(|&i| self.edges[i].source.as_str()).collect())
                .unwrap_or_default();
            in_degree.insert(node.id.clone(), distinct.len());
        }

        let mut loop_bodies = HashMap::new();
        for node in &self.nodes {
            let body_start = match &node.data {
                NodeData::LoopWhile(data) => Some(&data.body_start),
                NodeData::LoopForeach(data) => Some(&data.body_start),
                _ => None,
            };
            if let Some(start) = body_start {
                if !node_by_id.contains_key(start) {
                    return Err(DagError::UnknownBodyStart(node.id.clone(), start.clone()));
                }
                let body = collect_loop_body(&node.id, start, &outgoing, &self.edges);
                loop_bodies.insert(node.id.clone(), body);
            }
        }

        let index = DagIndex {
            node_by_id,
            outgoing,
            incoming,
            in_degree,
            loop_bodies,
        };
        index.check_acyclic(self)?;
        Ok(index)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All trigger nodes in declaration order.
    pub fn trigger_nodes(&self) -> impl Iterator<Item = (&Node, &TriggerData)> {
        self.nodes.iter().filter_map(|n| match &n.data {
            NodeData::Trigger(t) => Some((n, t)),
            _ => None,
        })
    }
}

impl DagIndex {
    pub fn contains(&self, node_id: &str) -> bool {
        self.node_by_id.contains_key(node_id)
    }

    pub fn node_index(&self, node_id: &str) -> Option<usize> {
        self.node_by_id.get(node_id).copied()
    }

    /// Outgoing edge indices for a node (declaration order).
    pub fn outgoing(&self, node_id: &str) -> &[usize] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming(&self, node_id: &str) -> &[usize] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct-predecessor in-degree, as counted for join satisfaction.
    pub fn in_degree(&self, node_id: &str) -> usize {
        self.in_degree.get(node_id).copied().unwrap_or(0)
    }

    /// Body subgraph of a loop node; empty if `node_id` is not a loop.
    pub fn loop_body(&self, node_id: &str) -> Option<&HashSet<String>> {
        self.loop_bodies.get(node_id)
    }

    /// True when `edge` is the back edge of a loop (body terminal -> loop).
    pub fn is_loop_back_edge(&self, edge: &Edge) -> bool {
        self.loop_bodies
            .get(&edge.target)
            .is_some_and(|body| body.contains(&edge.source))
    }

    /// Every node reachable from the given roots via any edge.
    pub fn reachable_from(&self, dag: &Dag, roots: &[&str]) -> HashSet<String> {
        let mut seen: HashSet<String> = roots.iter().map(|r| r.to_string()).collect();
        let mut queue: VecDeque<String> = seen.iter().cloned().collect();
        while let Some(id) = queue.pop_front() {
            for &edge_idx in self.outgoing(&id) {
                let target = &dag.edges[edge_idx].target;
                if seen.insert(target.clone()) {
                    queue.push_back(target.clone());
                }
            }
        }
        seen
    }

    /// DFS cycle check over all edges except loop back edges.
    fn check_acyclic(&self, dag: &Dag) -> Result<(), DagError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let mut marks: HashMap<&str, Mark> =
            dag.nodes.iter().map(|n| (n.id.as_str(), Mark::White)).collect();

        // Iterative DFS with an explicit stack to survive deep graphs.
        for root in dag.nodes.iter().map(|n| n.id.as_str()) {
            if marks[root] != Mark::White {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
            marks.insert(root, Mark::Grey);
            while let Some((id, edge_pos)) = stack.pop() {
                let edges = self.outgoing(id);
                if edge_pos < edges.len() {
                    stack.push((id, edge_pos + 1));
                    let edge = &dag.edges[edges[edge_pos]];
                    if self.is_loop_back_edge(edge) {
                        continue;
                    }
                    let target = edge.target.as_str();
                    match marks[target] {
                        Mark::Grey => return Err(DagError::ImplicitCycle(target.to_string())),
                        Mark::White => {
                            marks.insert(target, Mark::Grey);
                            stack.push((target, 0));
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks.insert(id, Mark::Black);
                }
            }
        }
        Ok(())
    }
}

/// BFS from `body_start`, stopping at (and excluding) the loop node itself.
fn collect_loop_body(
    loop_id: &str,
    body_start: &str,
    outgoing: &HashMap<String, Vec<usize>>,
    edges: &[Edge],
) -> HashSet<String> {
    let mut body = HashSet::new();
    let mut queue = VecDeque::new();
    if body_start != loop_id {
        body.insert(body_start.to_string());
        queue.push_back(body_start.to_string());
    }
    while let Some(id) = queue.pop_front() {
        for &edge_idx in outgoing.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            let target = &edges[edge_idx].target;
            if target == loop_id || body.contains(target) {
                continue;
            }
            body.insert(target.clone());
            queue.push_back(target.clone());
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trigger(id: &str) -> Node {
        Node {
            id: id.to_string(),
            data: NodeData::Trigger(TriggerData {
                kind: TriggerKind::EventBased,
                toolkit_slug: "gmail".into(),
                composio_trigger_slug: Some("GMAIL_NEW_MESSAGE".into()),
                connection_id: Some("conn-1".into()),
                filter: None,
                cron_expr: None,
                timezone: None,
                delivery: TriggerDelivery::Webhook,
                verify_signature: true,
                trigger_instance_id: None,
            }),
        }
    }

    fn action(id: &str) -> Node {
        Node {
            id: id.to_string(),
            data: NodeData::Action(ActionData {
                tool: "slack".into(),
                action: "SLACK_SEND_MESSAGE".into(),
                connection_id: "conn-2".into(),
                input_template: json!({"channel": "#general"}),
                output_vars: None,
                retry: None,
                timeout_ms: None,
            }),
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> Edge {
        Edge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            when: EdgeWhen::Always,
            condition: None,
        }
    }

    #[test]
    fn node_wire_format_uses_type_and_data() {
        let value = serde_json::to_value(action("a1")).unwrap();
        assert_eq!(value["id"], "a1");
        assert_eq!(value["type"], "action");
        assert_eq!(value["data"]["tool"], "slack");
    }

    #[test]
    fn join_mode_round_trips() {
        for (text, mode) in [
            ("all", JoinMode::All),
            ("any", JoinMode::Any),
            ("quorum:3", JoinMode::Quorum(3)),
        ] {
            assert_eq!(text.parse::<JoinMode>().unwrap(), mode);
            assert_eq!(mode.to_string(), text);
        }
        assert!("quorum:x".parse::<JoinMode>().is_err());
        assert!("most".parse::<JoinMode>().is_err());
    }

    #[test]
    fn index_rejects_duplicate_ids() {
        let dag = Dag {
            workflow_id: "wf".into(),
            version: 1,
            nodes: vec![trigger("t"), action("a"), action("a")],
            edges: vec![edge("e1", "t", "a")],
            globals: None,
        };
        assert!(matches!(dag.index(), Err(DagError::DuplicateNodeId(_))));
    }

    #[test]
    fn index_rejects_unknown_endpoint() {
        let dag = Dag {
            workflow_id: "wf".into(),
            version: 1,
            nodes: vec![trigger("t")],
            edges: vec![edge("e1", "t", "ghost")],
            globals: None,
        };
        assert!(matches!(dag.index(), Err(DagError::UnknownEndpoint { .. })));
    }

    #[test]
    fn index_rejects_cycle_outside_loops() {
        let dag = Dag {
            workflow_id: "wf".into(),
            version: 1,
            nodes: vec![trigger("t"), action("a"), action("b")],
            edges: vec![
                edge("e1", "t", "a"),
                edge("e2", "a", "b"),
                edge("e3", "b", "a"),
            ],
            globals: None,
        };
        assert!(matches!(dag.index(), Err(DagError::ImplicitCycle(_))));
    }

    #[test]
    fn loop_back_edge_is_not_a_cycle() {
        let dag = Dag {
            workflow_id: "wf".into(),
            version: 1,
            nodes: vec![
                trigger("t"),
                Node {
                    id: "loop".into(),
                    data: NodeData::LoopWhile(LoopWhileData {
                        condition: "vars.count < 3".into(),
                        body_start: "body".into(),
                        max_iterations: 10,
                    }),
                },
                action("body"),
                action("after"),
            ],
            edges: vec![
                edge("e1", "t", "loop"),
                edge("e2", "loop", "body"),
                edge("e3", "body", "loop"),
                edge("e4", "loop", "after"),
            ],
            globals: None,
        };
        let index = dag.index().unwrap();
        let body = index.loop_body("loop").unwrap();
        assert!(body.contains("body"));
        assert!(!body.contains("after"));
        assert_eq!(index.in_degree("loop"), 2);
    }

    #[test]
    fn reachability_walks_all_edges() {
        let dag = Dag {
            workflow_id: "wf".into(),
            version: 1,
            nodes: vec![trigger("t"), action("a"), action("orphan")],
            edges: vec![edge("e1", "t", "a")],
            globals: None,
        };
        let index = dag.index().unwrap();
        let reachable = index.reachable_from(&dag, &["t"]);
        assert!(reachable.contains("a"));
        assert!(!reachable.contains("orphan"));
    }
}
