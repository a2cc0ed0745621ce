//! Persistence interfaces and in-memory implementations.
//!
//! Three stores back the control plane: workflow documents, run state, and
//! schedules. All three are trait objects so tests and embedders inject
//! doubles; the Postgres implementations live in `store_postgres`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::dag::Dag;
use crate::run_state::{
    JoinArrival, NodeExecution, RunStatus, Schedule, ScheduleRun, ScheduleRunStatus, WorkflowRun,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Versioned DAG documents keyed by `(workflow_id, version)`.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_dag(&self, dag: &Dag) -> StoreResult<()>;
    async fn load_dag(&self, workflow_id: &str, version: u32) -> StoreResult<Option<Dag>>;
    async fn list_versions(&self, workflow_id: &str) -> StoreResult<Vec<u32>>;
    /// Every stored DAG; used to build the trigger resolution index.
    async fn all_dags(&self) -> StoreResult<Vec<Dag>>;
}

/// Runs, node executions, join arrivals, and run leases.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &WorkflowRun) -> StoreResult<()>;
    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<WorkflowRun>>;
    async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Insert or update the row keyed by `(run_id, node_id, attempt)`.
    async fn upsert_node_execution(&self, execution: &NodeExecution) -> StoreResult<()>;
    async fn node_executions(&self, run_id: Uuid) -> StoreResult<Vec<NodeExecution>>;

    /// Record an arrival and return the distinct arrived predecessor count.
    async fn record_join_arrival(
        &self,
        run_id: Uuid,
        join_node_id: &str,
        from_node_id: &str,
    ) -> StoreResult<usize>;
    async fn join_arrivals(&self, run_id: Uuid, join_node_id: &str) -> StoreResult<Vec<JoinArrival>>;
    /// Forget arrivals for a join; used when a loop re-enters its body.
    async fn clear_join_arrivals(&self, run_id: Uuid, join_node_id: &str) -> StoreResult<()>;

    /// Try to take the run lease. Returns false when another live owner
    /// holds it.
    async fn acquire_run_lease(&self, run_id: Uuid, owner: &str, ttl: Duration) -> StoreResult<bool>;
    async fn renew_run_lease(&self, run_id: Uuid, owner: &str, ttl: Duration) -> StoreResult<bool>;
    async fn release_run_lease(&self, run_id: Uuid, owner: &str) -> StoreResult<()>;
}

/// Schedules and their emission log.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn upsert_schedule(&self, schedule: &Schedule) -> StoreResult<()>;
    async fn get_schedule(&self, schedule_id: Uuid) -> StoreResult<Option<Schedule>>;
    async fn delete_schedule(&self, schedule_id: Uuid) -> StoreResult<()>;
    async fn set_paused(&self, schedule_id: Uuid, paused: bool) -> StoreResult<()>;

    /// Unpaused, unexpired schedules with `next_run_at <= horizon`.
    async fn due_schedules(&self, horizon: DateTime<Utc>) -> StoreResult<Vec<Schedule>>;
    async fn update_next_run_at(
        &self,
        schedule_id: Uuid,
        next_run_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn get_schedule_run(&self, idempotency_key: &str) -> StoreResult<Option<ScheduleRun>>;
    /// Insert keyed by idempotency key. Returns false when the key exists
    /// (the exactly-once guard).
    async fn insert_schedule_run(&self, run: &ScheduleRun) -> StoreResult<bool>;
    async fn update_schedule_run_status(
        &self,
        idempotency_key: &str,
        status: ScheduleRunStatus,
        run_id: Option<Uuid>,
    ) -> StoreResult<()>;
    async fn has_inflight_runs(&self, schedule_id: Uuid) -> StoreResult<bool>;
    /// Every ENQUEUED/STARTED emission, for run-status reconciliation.
    async fn list_inflight_runs(&self) -> StoreResult<Vec<ScheduleRun>>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryWorkflowStore {
    dags: Mutex<HashMap<(String, u32), Dag>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn save_dag(&self, dag: &Dag) -> StoreResult<()> {
        let mut dags = self.dags.lock().unwrap_or_else(|e| e.into_inner());
        dags.insert((dag.workflow_id.clone(), dag.version), dag.clone());
        Ok(())
    }

    async fn load_dag(&self, workflow_id: &str, version: u32) -> StoreResult<Option<Dag>> {
        let dags = self.dags.lock().unwrap_or_else(|e| e.into_inner());
        Ok(dags.get(&(workflow_id.to_string(), version)).cloned())
    }

    async fn list_versions(&self, workflow_id: &str) -> StoreResult<Vec<u32>> {
        let dags = self.dags.lock().unwrap_or_else(|e| e.into_inner());
        let mut versions: Vec<u32> = dags
            .keys()
            .filter(|(id, _)| id == workflow_id)
            .map(|(_, v)| *v)
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn all_dags(&self) -> StoreResult<Vec<Dag>> {
        let dags = self.dags.lock().unwrap_or_else(|e| e.into_inner());
        Ok(dags.values().cloned().collect())
    }
}

struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct RunTables {
    runs: HashMap<Uuid, WorkflowRun>,
    executions: HashMap<(Uuid, String, u32), NodeExecution>,
    arrivals: Vec<JoinArrival>,
    leases: HashMap<Uuid, Lease>,
}

#[derive(Default)]
pub struct MemoryRunStore {
    tables: Mutex<RunTables>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if tables.runs.contains_key(&run.run_id) {
            return Err(StoreError::Conflict(format!("run {} exists", run.run_id)));
        }
        tables.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<WorkflowRun>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.runs.get(&run_id).cloned())
    }

    async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        run.status = status;
        if finished_at.is_some() {
            run.finished_at = finished_at;
        }
        Ok(())
    }

    async fn upsert_node_execution(&self, execution: &NodeExecution) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.executions.insert(
            (
                execution.run_id,
                execution.node_id.clone(),
                execution.attempt,
            ),
            execution.clone(),
        );
        Ok(())
    }

    async fn node_executions(&self, run_id: Uuid) -> StoreResult<Vec<NodeExecution>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<NodeExecution> = tables
            .executions
            .values()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.node_id, a.attempt).cmp(&(&b.node_id, b.attempt)));
        Ok(rows)
    }

    async fn record_join_arrival(
        &self,
        run_id: Uuid,
        join_node_id: &str,
        from_node_id: &str,
    ) -> StoreResult<usize> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let exists = tables.arrivals.iter().any(|a| {
            a.run_id == run_id && a.join_node_id == join_node_id && a.from_node_id == from_node_id
        });
        if !exists {
            tables.arrivals.push(JoinArrival {
                run_id,
                join_node_id: join_node_id.to_string(),
                from_node_id: from_node_id.to_string(),
                arrived_at: Utc::now(),
            });
        }
        Ok(tables
            .arrivals
            .iter()
            .filter(|a| a.run_id == run_id && a.join_node_id == join_node_id)
            .count())
    }

    async fn join_arrivals(
        &self,
        run_id: Uuid,
        join_node_id: &str,
    ) -> StoreResult<Vec<JoinArrival>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .arrivals
            .iter()
            .filter(|a| a.run_id == run_id && a.join_node_id == join_node_id)
            .cloned()
            .collect())
    }

    async fn clear_join_arrivals(&self, run_id: Uuid, join_node_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .arrivals
            .retain(|a| !(a.run_id == run_id && a.join_node_id == join_node_id));
        Ok(())
    }

    async fn acquire_run_lease(
        &self,
        run_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
        match tables.leases.get(&run_id) {
            Some(lease) if lease.owner != owner && lease.expires_at > now => Ok(false),
            _ => {
                tables.leases.insert(
                    run_id,
                    Lease {
                        owner: owner.to_string(),
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew_run_lease(&self, run_id: Uuid, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        match tables.leases.get_mut(&run_id) {
            Some(lease) if lease.owner == owner && lease.expires_at > now => {
                lease.expires_at =
                    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_run_lease(&self, run_id: Uuid, owner: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if tables
            .leases
            .get(&run_id)
            .is_some_and(|lease| lease.owner == owner)
        {
            tables.leases.remove(&run_id);
        }
        Ok(())
    }
}

#[derive(Default)]
struct ScheduleTables {
    schedules: HashMap<Uuid, Schedule>,
    schedule_runs: HashMap<String, ScheduleRun>,
}

#[derive(Default)]
pub struct MemoryScheduleStore {
    tables: Mutex<ScheduleTables>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn upsert_schedule(&self, schedule: &Schedule) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.schedules.insert(schedule.schedule_id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: Uuid) -> StoreResult<Option<Schedule>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.schedules.get(&schedule_id).cloned())
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.schedules.remove(&schedule_id);
        Ok(())
    }

    async fn set_paused(&self, schedule_id: Uuid, paused: bool) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let schedule = tables
            .schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| StoreError::NotFound(format!("schedule {schedule_id}")))?;
        schedule.paused = paused;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn due_schedules(&self, horizon: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut due: Vec<Schedule> = tables
            .schedules
            .values()
            .filter(|s| !s.paused)
            .filter(|s| s.end_at.map_or(true, |end| end >= now))
            .filter(|s| s.next_run_at <= horizon)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn update_next_run_at(
        &self,
        schedule_id: Uuid,
        next_run_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let schedule = tables
            .schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| StoreError::NotFound(format!("schedule {schedule_id}")))?;
        schedule.next_run_at = next_run_at;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn get_schedule_run(&self, idempotency_key: &str) -> StoreResult<Option<ScheduleRun>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.schedule_runs.get(idempotency_key).cloned())
    }

    async fn insert_schedule_run(&self, run: &ScheduleRun) -> StoreResult<bool> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if tables.schedule_runs.contains_key(&run.idempotency_key) {
            return Ok(false);
        }
        tables
            .schedule_runs
            .insert(run.idempotency_key.clone(), run.clone());
        Ok(true)
    }

    async fn update_schedule_run_status(
        &self,
        idempotency_key: &str,
        status: ScheduleRunStatus,
        run_id: Option<Uuid>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let run = tables
            .schedule_runs
            .get_mut(idempotency_key)
            .ok_or_else(|| StoreError::NotFound(format!("schedule run {idempotency_key}")))?;
        run.status = status;
        if run_id.is_some() {
            run.run_id = run_id;
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn has_inflight_runs(&self, schedule_id: Uuid) -> StoreResult<bool> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .schedule_runs
            .values()
            .any(|r| r.schedule_id == schedule_id && r.status.is_inflight()))
    }

    async fn list_inflight_runs(&self) -> StoreResult<Vec<ScheduleRun>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .schedule_runs
            .values()
            .filter(|r| r.status.is_inflight())
            .cloned()
            .collect())
    }
}

/// Helper: the current (max-attempt) execution per node for a run.
pub fn current_attempts(executions: &[NodeExecution]) -> HashMap<String, NodeExecution> {
    let mut current: HashMap<String, NodeExecution> = HashMap::new();
    for execution in executions {
        match current.get(&execution.node_id) {
            Some(existing) if existing.attempt >= execution.attempt => {}
            _ => {
                current.insert(execution.node_id.clone(), execution.clone());
            }
        }
    }
    current
}

/// Helper: true when the node's current attempt reached a final status.
pub fn node_is_final(executions: &[NodeExecution], node_id: &str) -> bool {
    current_attempts(executions)
        .get(node_id)
        .map(|e| e.status.is_final())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::{NodeStatus, RunSource};
    use serde_json::json;

    fn sample_run() -> WorkflowRun {
        WorkflowRun {
            run_id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            version: 1,
            user_id: "u1".into(),
            status: RunStatus::Running,
            source: RunSource::Manual,
            started_at: Utc::now(),
            finished_at: None,
            trigger_digest: "d".into(),
        }
    }

    #[tokio::test]
    async fn schedule_run_insert_is_idempotent() {
        let store = MemoryScheduleStore::new();
        let run = ScheduleRun {
            idempotency_key: "abc".into(),
            schedule_id: Uuid::new_v4(),
            run_at: Utc::now(),
            status: ScheduleRunStatus::Enqueued,
            run_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(store.insert_schedule_run(&run).await.unwrap());
        assert!(!store.insert_schedule_run(&run).await.unwrap());
    }

    #[tokio::test]
    async fn join_arrivals_count_distinct_sources() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::new_v4();
        assert_eq!(store.record_join_arrival(run_id, "j", "a").await.unwrap(), 1);
        assert_eq!(store.record_join_arrival(run_id, "j", "a").await.unwrap(), 1);
        assert_eq!(store.record_join_arrival(run_id, "j", "b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lease_blocks_second_owner_until_release() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::new_v4();
        let ttl = Duration::from_secs(30);
        assert!(store.acquire_run_lease(run_id, "w1", ttl).await.unwrap());
        assert!(!store.acquire_run_lease(run_id, "w2", ttl).await.unwrap());
        assert!(store.renew_run_lease(run_id, "w1", ttl).await.unwrap());
        store.release_run_lease(run_id, "w1").await.unwrap();
        assert!(store.acquire_run_lease(run_id, "w2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn current_attempt_is_the_max() {
        let store = MemoryRunStore::new();
        let run = sample_run();
        store.create_run(&run).await.unwrap();
        for (attempt, status) in [(1u32, NodeStatus::Running), (2, NodeStatus::Done)] {
            store
                .upsert_node_execution(&NodeExecution {
                    run_id: run.run_id,
                    node_id: "a1".into(),
                    attempt,
                    status,
                    output_ref: Some(json!({"ok": true})),
                    error: None,
                    started_at: Utc::now(),
                    finished_at: None,
                    idem_key: None,
                })
                .await
                .unwrap();
        }
        let executions = store.node_executions(run.run_id).await.unwrap();
        let current = current_attempts(&executions);
        assert_eq!(current["a1"].attempt, 2);
        assert!(node_is_final(&executions, "a1"));
    }

    #[tokio::test]
    async fn versions_are_sorted() {
        let store = MemoryWorkflowStore::new();
        for version in [3u32, 1, 2] {
            store
                .save_dag(&Dag {
                    workflow_id: "wf".into(),
                    version,
                    nodes: vec![],
                    edges: vec![],
                    globals: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.list_versions("wf").await.unwrap(), vec![1, 2, 3]);
    }
}
