//! Postgres-backed stores.
//!
//! Runtime sqlx queries (no compile-time macros) in the same shape as the
//! in-memory stores. Schemas are append-mostly; status updates are
//! in-place keyed by primary key, and every table carries
//! `created_at`/`updated_at`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::dag::Dag;
use crate::run_state::{
    CatchupPolicy, JoinArrival, NodeExecution, NodeStatus, OverlapPolicy, RunSource, RunStatus,
    Schedule, ScheduleRun, ScheduleRunStatus, WorkflowRun,
};
use crate::store::{RunStore, ScheduleStore, StoreError, StoreResult, WorkflowStore};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> StoreResult<T> {
    raw.parse().map_err(StoreError::Database)
}

/// Shared Postgres pool wrapper implementing all three store traits.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Create all control-plane tables.
    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                dag JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (workflow_id, version)
            );

            CREATE TABLE IF NOT EXISTS runs (
                run_id UUID PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                trigger_digest TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS node_executions (
                run_id UUID NOT NULL REFERENCES runs(run_id),
                node_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                output_ref JSONB,
                error TEXT,
                idem_key TEXT,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (run_id, node_id, attempt)
            );

            CREATE TABLE IF NOT EXISTS join_arrivals (
                run_id UUID NOT NULL,
                join_node_id TEXT NOT NULL,
                from_node_id TEXT NOT NULL,
                arrived_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (run_id, join_node_id, from_node_id)
            );

            CREATE TABLE IF NOT EXISTS run_leases (
                run_id UUID PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schedules (
                schedule_id UUID PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                cron_expr TEXT NOT NULL,
                timezone TEXT NOT NULL,
                start_at TIMESTAMPTZ,
                end_at TIMESTAMPTZ,
                next_run_at TIMESTAMPTZ NOT NULL,
                paused BOOLEAN NOT NULL DEFAULT FALSE,
                jitter_ms BIGINT NOT NULL DEFAULT 0,
                overlap_policy TEXT NOT NULL,
                catchup_policy TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_schedules_due
                ON schedules(next_run_at)
                WHERE paused = FALSE;

            CREATE TABLE IF NOT EXISTS schedule_runs (
                idempotency_key TEXT PRIMARY KEY,
                schedule_id UUID NOT NULL,
                run_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                run_id UUID,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_schedule_runs_inflight
                ON schedule_runs(schedule_id)
                WHERE status IN ('ENQUEUED', 'STARTED');
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkflowStore for PostgresStore {
    async fn save_dag(&self, dag: &Dag) -> StoreResult<()> {
        let dag_json = serde_json::to_value(dag)?;
        sqlx::query(
            r#"
            INSERT INTO workflows (workflow_id, version, dag)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, version)
            DO UPDATE SET dag = EXCLUDED.dag, updated_at = NOW()
            "#,
        )
        .bind(&dag.workflow_id)
        .bind(dag.version as i32)
        .bind(dag_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_dag(&self, workflow_id: &str, version: u32) -> StoreResult<Option<Dag>> {
        let row = sqlx::query("SELECT dag FROM workflows WHERE workflow_id = $1 AND version = $2")
            .bind(workflow_id)
            .bind(version as i32)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let dag_json: Value = row.get("dag");
                Ok(Some(serde_json::from_value(dag_json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_versions(&self, workflow_id: &str) -> StoreResult<Vec<u32>> {
        let rows =
            sqlx::query("SELECT version FROM workflows WHERE workflow_id = $1 ORDER BY version")
                .bind(workflow_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<i32, _>("version") as u32)
            .collect())
    }

    async fn all_dags(&self) -> StoreResult<Vec<Dag>> {
        let rows = sqlx::query("SELECT dag FROM workflows").fetch_all(&self.pool).await?;
        let mut dags = Vec::with_capacity(rows.len());
        for row in rows {
            let dag_json: Value = row.get("dag");
            dags.push(serde_json::from_value(dag_json)?);
        }
        Ok(dags)
    }
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

fn run_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<WorkflowRun> {
    Ok(WorkflowRun {
        run_id: row.get("run_id"),
        workflow_id: row.get("workflow_id"),
        version: row.get::<i32, _>("version") as u32,
        user_id: row.get("user_id"),
        status: parse_enum::<RunStatus>(row.get("status"))?,
        source: parse_enum::<RunSource>(row.get("source"))?,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        trigger_digest: row.get("trigger_digest"),
    })
}

#[async_trait]
impl RunStore for PostgresStore {
    async fn create_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runs
                (run_id, workflow_id, version, user_id, status, source,
                 trigger_digest, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.workflow_id)
        .bind(run.version as i32)
        .bind(&run.user_id)
        .bind(run.status.as_str())
        .bind(run.source.as_str())
        .bind(&run.trigger_digest)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = $2,
                finished_at = COALESCE($3, finished_at),
                updated_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_node_execution(&self, execution: &NodeExecution) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO node_executions
                (run_id, node_id, attempt, status, output_ref, error, idem_key,
                 started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (run_id, node_id, attempt)
            DO UPDATE SET
                status = EXCLUDED.status,
                output_ref = EXCLUDED.output_ref,
                error = EXCLUDED.error,
                idem_key = EXCLUDED.idem_key,
                finished_at = EXCLUDED.finished_at,
                updated_at = NOW()
            "#,
        )
        .bind(execution.run_id)
        .bind(&execution.node_id)
        .bind(execution.attempt as i32)
        .bind(execution.status.as_str())
        .bind(&execution.output_ref)
        .bind(&execution.error)
        .bind(&execution.idem_key)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn node_executions(&self, run_id: Uuid) -> StoreResult<Vec<NodeExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM node_executions WHERE run_id = $1 ORDER BY node_id, attempt",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(NodeExecution {
                    run_id: row.get("run_id"),
                    node_id: row.get("node_id"),
                    attempt: row.get::<i32, _>("attempt") as u32,
                    status: parse_enum::<NodeStatus>(row.get("status"))?,
                    output_ref: row.get("output_ref"),
                    error: row.get("error"),
                    started_at: row.get("started_at"),
                    finished_at: row.get("finished_at"),
                    idem_key: row.get("idem_key"),
                })
            })
            .collect()
    }

    async fn record_join_arrival(
        &self,
        run_id: Uuid,
        join_node_id: &str,
        from_node_id: &str,
    ) -> StoreResult<usize> {
        sqlx::query(
            r#"
            INSERT INTO join_arrivals (run_id, join_node_id, from_node_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(join_node_id)
        .bind(from_node_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS arrived FROM join_arrivals WHERE run_id = $1 AND join_node_id = $2",
        )
        .bind(run_id)
        .bind(join_node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("arrived") as usize)
    }

    async fn join_arrivals(
        &self,
        run_id: Uuid,
        join_node_id: &str,
    ) -> StoreResult<Vec<JoinArrival>> {
        let rows = sqlx::query(
            "SELECT * FROM join_arrivals WHERE run_id = $1 AND join_node_id = $2 ORDER BY arrived_at",
        )
        .bind(run_id)
        .bind(join_node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| JoinArrival {
                run_id: row.get("run_id"),
                join_node_id: row.get("join_node_id"),
                from_node_id: row.get("from_node_id"),
                arrived_at: row.get("arrived_at"),
            })
            .collect())
    }

    async fn clear_join_arrivals(&self, run_id: Uuid, join_node_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM join_arrivals WHERE run_id = $1 AND join_node_id = $2")
            .bind(run_id)
            .bind(join_node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn acquire_run_lease(
        &self,
        run_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let result = sqlx::query(
            r#"
            INSERT INTO run_leases (run_id, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (run_id) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE run_leases.owner = EXCLUDED.owner
                   OR run_leases.expires_at < NOW()
            "#,
        )
        .bind(run_id)
        .bind(owner)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew_run_lease(&self, run_id: Uuid, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let result = sqlx::query(
            r#"
            UPDATE run_leases
            SET expires_at = $3
            WHERE run_id = $1 AND owner = $2 AND expires_at > NOW()
            "#,
        )
        .bind(run_id)
        .bind(owner)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_run_lease(&self, run_id: Uuid, owner: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM run_leases WHERE run_id = $1 AND owner = $2")
            .bind(run_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScheduleStore
// ---------------------------------------------------------------------------

fn schedule_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Schedule> {
    Ok(Schedule {
        schedule_id: row.get("schedule_id"),
        workflow_id: row.get("workflow_id"),
        version: row.get::<i32, _>("version") as u32,
        user_id: row.get("user_id"),
        cron_expr: row.get("cron_expr"),
        timezone: row.get("timezone"),
        start_at: row.get("start_at"),
        end_at: row.get("end_at"),
        next_run_at: row.get("next_run_at"),
        paused: row.get("paused"),
        jitter_ms: row.get::<i64, _>("jitter_ms") as u64,
        overlap_policy: parse_enum::<OverlapPolicy>(row.get("overlap_policy"))?,
        catchup_policy: parse_enum::<CatchupPolicy>(row.get("catchup_policy"))?,
        updated_at: row.get("updated_at"),
    })
}

fn schedule_run_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<ScheduleRun> {
    Ok(ScheduleRun {
        idempotency_key: row.get("idempotency_key"),
        schedule_id: row.get("schedule_id"),
        run_at: row.get("run_at"),
        status: parse_enum::<ScheduleRunStatus>(row.get("status"))?,
        run_id: row.get("run_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl ScheduleStore for PostgresStore {
    async fn upsert_schedule(&self, schedule: &Schedule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules
                (schedule_id, workflow_id, version, user_id, cron_expr, timezone,
                 start_at, end_at, next_run_at, paused, jitter_ms,
                 overlap_policy, catchup_policy)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (schedule_id) DO UPDATE SET
                workflow_id = EXCLUDED.workflow_id,
                version = EXCLUDED.version,
                cron_expr = EXCLUDED.cron_expr,
                timezone = EXCLUDED.timezone,
                start_at = EXCLUDED.start_at,
                end_at = EXCLUDED.end_at,
                next_run_at = EXCLUDED.next_run_at,
                paused = EXCLUDED.paused,
                jitter_ms = EXCLUDED.jitter_ms,
                overlap_policy = EXCLUDED.overlap_policy,
                catchup_policy = EXCLUDED.catchup_policy,
                updated_at = NOW()
            "#,
        )
        .bind(schedule.schedule_id)
        .bind(&schedule.workflow_id)
        .bind(schedule.version as i32)
        .bind(&schedule.user_id)
        .bind(&schedule.cron_expr)
        .bind(&schedule.timezone)
        .bind(schedule.start_at)
        .bind(schedule.end_at)
        .bind(schedule.next_run_at)
        .bind(schedule.paused)
        .bind(schedule.jitter_ms as i64)
        .bind(schedule.overlap_policy.as_str())
        .bind(schedule.catchup_policy.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: Uuid) -> StoreResult<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE schedule_id = $1")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM schedules WHERE schedule_id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_paused(&self, schedule_id: Uuid, paused: bool) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE schedules SET paused = $2, updated_at = NOW() WHERE schedule_id = $1")
                .bind(schedule_id)
                .bind(paused)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("schedule {schedule_id}")));
        }
        Ok(())
    }

    async fn due_schedules(&self, horizon: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM schedules
            WHERE paused = FALSE
              AND (end_at IS NULL OR end_at >= NOW())
              AND next_run_at <= $1
            ORDER BY next_run_at
            "#,
        )
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn update_next_run_at(
        &self,
        schedule_id: Uuid,
        next_run_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE schedules SET next_run_at = $2, updated_at = NOW() WHERE schedule_id = $1",
        )
        .bind(schedule_id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schedule_run(&self, idempotency_key: &str) -> StoreResult<Option<ScheduleRun>> {
        let row = sqlx::query("SELECT * FROM schedule_runs WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(schedule_run_from_row).transpose()
    }

    async fn insert_schedule_run(&self, run: &ScheduleRun) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO schedule_runs
                (idempotency_key, schedule_id, run_at, status, run_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&run.idempotency_key)
        .bind(run.schedule_id)
        .bind(run.run_at)
        .bind(run.status.as_str())
        .bind(run.run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_schedule_run_status(
        &self,
        idempotency_key: &str,
        status: ScheduleRunStatus,
        run_id: Option<Uuid>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE schedule_runs
            SET status = $2,
                run_id = COALESCE($3, run_id),
                updated_at = NOW()
            WHERE idempotency_key = $1
            "#,
        )
        .bind(idempotency_key)
        .bind(status.as_str())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_inflight_runs(&self, schedule_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM schedule_runs
                WHERE schedule_id = $1 AND status IN ('ENQUEUED', 'STARTED')
            ) AS inflight
            "#,
        )
        .bind(schedule_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<bool, _>("inflight"))
    }

    async fn list_inflight_runs(&self) -> StoreResult<Vec<ScheduleRun>> {
        let rows =
            sqlx::query("SELECT * FROM schedule_runs WHERE status IN ('ENQUEUED', 'STARTED')")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(schedule_run_from_row).collect()
    }
}
