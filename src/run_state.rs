//! Persistent record types and status enums for runs and schedules.
//!
//! Statuses round-trip through stable uppercase strings so the Postgres and
//! in-memory stores agree on the wire representation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant)),+,
                    other => Err(format!(concat!("unknown ", stringify!($name), " '{}'"), other)),
                }
            }
        }
    };
}

string_enum!(
    /// Terminal-or-running status of a whole run.
    RunStatus {
        Running => "RUNNING",
        Success => "SUCCESS",
        Failed => "FAILED",
    }
);

string_enum!(
    /// What activated a run.
    RunSource {
        Event => "event",
        Schedule => "schedule",
        Manual => "manual",
    }
);

string_enum!(
    /// Per-attempt node execution status.
    NodeStatus {
        Pending => "PENDING",
        Running => "RUNNING",
        Done => "DONE",
        Error => "ERROR",
        Skipped => "SKIPPED",
    }
);

impl NodeStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Error | NodeStatus::Skipped)
    }
}

string_enum!(
    /// Status of one planned schedule emission.
    ScheduleRunStatus {
        Enqueued => "ENQUEUED",
        Started => "STARTED",
        Success => "SUCCESS",
        Failed => "FAILED",
        Skipped => "SKIPPED",
    }
);

impl ScheduleRunStatus {
    /// In-flight states considered by the overlap policy.
    pub fn is_inflight(&self) -> bool {
        matches!(self, ScheduleRunStatus::Enqueued | ScheduleRunStatus::Started)
    }
}

string_enum!(
    /// What to do when a new fire time arrives while a run is in flight.
    OverlapPolicy {
        Allow => "allow",
        Skip => "skip",
        Queue => "queue",
    }
);

string_enum!(
    /// What to do with fire times that fell during downtime.
    CatchupPolicy {
        None => "none",
        FireImmediately => "fire_immediately",
        Spread => "spread",
    }
);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub version: u32,
    pub user_id: String,
    pub status: RunStatus,
    pub source: RunSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Digest of the trigger payload, for event replay detection.
    pub trigger_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub status: NodeStatus,
    /// Compact output, or a `{"ref": node_id}` marker for artifact payloads.
    pub output_ref: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub idem_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinArrival {
    pub run_id: Uuid,
    pub join_node_id: String,
    pub from_node_id: String,
    pub arrived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: Uuid,
    pub workflow_id: String,
    pub version: u32,
    pub user_id: String,
    pub cron_expr: String,
    /// IANA timezone name, e.g. `America/New_York`.
    pub timezone: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub paused: bool,
    pub jitter_ms: u64,
    pub overlap_policy: OverlapPolicy,
    pub catchup_policy: CatchupPolicy,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub idempotency_key: String,
    pub schedule_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub status: ScheduleRunStatus,
    pub run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

/// In-memory working state of one run.
///
/// `inputs` is the immutable trigger payload. `vars` holds compact scalars
/// extracted through `output_vars`. `artifacts` holds full action results
/// keyed by node id (referenced from persisted rows as `{"ref": ...}`).
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub inputs: Value,
    pub vars: serde_json::Map<String, Value>,
    pub globals: serde_json::Map<String, Value>,
    pub artifacts: HashMap<String, Value>,
    pub errors: HashMap<String, String>,
    /// Slim outputs per node, the `node[id].outputs` expression namespace.
    pub node_outputs: HashMap<String, Value>,
}

impl RunContext {
    pub fn new(inputs: Value, globals: serde_json::Map<String, Value>) -> Self {
        Self {
            inputs,
            globals,
            ..Default::default()
        }
    }

    pub fn scope(&self) -> crate::ast_evaluator::Scope<'_> {
        crate::ast_evaluator::Scope {
            inputs: &self.inputs,
            vars: &self.vars,
            globals: &self.globals,
            node_outputs: &self.node_outputs,
        }
    }
}

/// Compact a result for caching and persistence: keep scalars, short
/// arrays, and small objects; drop anything bulky.
pub fn slim_result(result: &Value) -> Value {
    match result {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                match value {
                    Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                        out.insert(key.clone(), value.clone());
                    }
                    Value::Array(items) if items.len() < 10 => {
                        out.insert(key.clone(), value.clone());
                    }
                    Value::Object(_) if value.to_string().len() < 1_000 => {
                        out.insert(key.clone(), value.clone());
                    }
                    _ => {}
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Resolve a dotted path (e.g. `data.id`) into a result value.
///
/// Used by `output_vars` extraction; a missing path yields `None` rather
/// than an error so optional outputs do not fail the node.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
