//! Event delivery resolution.
//!
//! Incoming webhook deliveries are opaque; the control plane only resolves
//! them to a trigger instance. The index is compiled from stored DAGs and
//! matches on `(toolkit_slug, trigger_slug, connection_id)` plus a
//! subset-match of the trigger's filter against the payload.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::dag::{Dag, TriggerKind};

/// An opaque delivery from the event source.
#[derive(Debug, Clone)]
pub struct EventDelivery {
    pub toolkit_slug: String,
    pub trigger_slug: String,
    pub connection_id: String,
    pub payload: Value,
}

/// A resolved binding of a trigger node to its workflow.
#[derive(Debug, Clone)]
pub struct TriggerBinding {
    pub trigger_instance_id: String,
    pub workflow_id: String,
    pub version: u32,
    pub node_id: String,
    pub filter: Option<Value>,
}

/// Compiled in-memory index over every event-based trigger in the stored
/// DAGs. Rebuild after workflow writes.
#[derive(Debug, Default)]
pub struct TriggerIndex {
    by_route: HashMap<(String, String, String), Vec<TriggerBinding>>,
}

impl TriggerIndex {
    pub fn build(dags: &[Dag]) -> Self {
        let mut by_route: HashMap<(String, String, String), Vec<TriggerBinding>> = HashMap::new();
        for dag in dags {
            for (node, trigger) in dag.trigger_nodes() {
                if trigger.kind != TriggerKind::EventBased {
                    continue;
                }
                let (Some(slug), Some(connection_id), Some(instance_id)) = (
                    trigger.composio_trigger_slug.as_ref(),
                    trigger.connection_id.as_ref(),
                    trigger.trigger_instance_id.as_ref(),
                ) else {
                    continue;
                };
                by_route
                    .entry((
                        trigger.toolkit_slug.clone(),
                        slug.clone(),
                        connection_id.clone(),
                    ))
                    .or_default()
                    .push(TriggerBinding {
                        trigger_instance_id: instance_id.clone(),
                        workflow_id: dag.workflow_id.clone(),
                        version: dag.version,
                        node_id: node.id.clone(),
                        filter: trigger.filter.clone(),
                    });
            }
        }
        Self { by_route }
    }

    /// Resolve a delivery; `None` means discard.
    pub fn resolve(&self, delivery: &EventDelivery) -> Option<&TriggerBinding> {
        let key = (
            delivery.toolkit_slug.clone(),
            delivery.trigger_slug.clone(),
            delivery.connection_id.clone(),
        );
        let candidates = self.by_route.get(&key)?;
        let binding = candidates
            .iter()
            .find(|b| filter_matches(b.filter.as_ref(), &delivery.payload));
        if binding.is_none() {
            debug!(
                toolkit = %delivery.toolkit_slug,
                trigger = %delivery.trigger_slug,
                "delivery matched a route but no filter",
            );
        }
        binding
    }

    pub fn len(&self) -> usize {
        self.by_route.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_route.is_empty()
    }
}

/// Every key in the filter must be equal in the payload. A missing filter
/// matches everything; reserved keys (like the poll cursor) are ignored.
fn filter_matches(filter: Option<&Value>, payload: &Value) -> bool {
    let Some(Value::Object(filter)) = filter else {
        return true;
    };
    filter
        .iter()
        .filter(|(key, _)| key.as_str() != "cursor")
        .all(|(key, expected)| payload.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Node, NodeData, TriggerData, TriggerDelivery};
    use serde_json::json;

    fn dag_with_trigger(filter: Option<Value>) -> Dag {
        Dag {
            workflow_id: "wf".into(),
            version: 1,
            nodes: vec![Node {
                id: "t1".into(),
                data: NodeData::Trigger(TriggerData {
                    kind: TriggerKind::EventBased,
                    toolkit_slug: "gmail".into(),
                    composio_trigger_slug: Some("GMAIL_NEW_MESSAGE".into()),
                    connection_id: Some("c1".into()),
                    filter,
                    cron_expr: None,
                    timezone: None,
                    delivery: TriggerDelivery::Webhook,
                    verify_signature: true,
                    trigger_instance_id: Some("abc123".into()),
                }),
            }],
            edges: vec![],
            globals: None,
        }
    }

    #[test]
    fn resolves_by_route_and_filter() {
        let dags = vec![dag_with_trigger(Some(json!({"label": "INBOX"})))];
        let index = TriggerIndex::build(&dags);
        assert_eq!(index.len(), 1);

        let hit = EventDelivery {
            toolkit_slug: "gmail".into(),
            trigger_slug: "GMAIL_NEW_MESSAGE".into(),
            connection_id: "c1".into(),
            payload: json!({"label": "INBOX", "subject": "hi"}),
        };
        let binding = index.resolve(&hit).unwrap();
        assert_eq!(binding.trigger_instance_id, "abc123");
        assert_eq!(binding.node_id, "t1");

        let miss_filter = EventDelivery {
            payload: json!({"label": "SPAM"}),
            ..hit.clone()
        };
        assert!(index.resolve(&miss_filter).is_none());

        let miss_route = EventDelivery {
            connection_id: "c-other".into(),
            ..hit
        };
        assert!(index.resolve(&miss_route).is_none());
    }

    #[test]
    fn schedule_triggers_are_not_indexed() {
        let mut dag = dag_with_trigger(None);
        if let NodeData::Trigger(t) = &mut dag.nodes[0].data {
            t.kind = TriggerKind::ScheduleBased;
        }
        let index = TriggerIndex::build(&[dag]);
        assert!(index.is_empty());
    }
}
