//! Cron scheduler.
//!
//! A single-leader worker ticks on an interval, enumerates due fire times
//! per schedule (IANA-timezone and DST aware), applies catchup, overlap,
//! and jitter policies, and hands activations to the executor through the
//! [`RunLauncher`] seam. The `schedule_runs` idempotency key is the sole
//! exactly-once guard, so ticks are crash-safe: nothing is committed
//! before that row exists.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::executor::{ExecError, Executor};
use crate::run_state::{
    CatchupPolicy, OverlapPolicy, RunSource, Schedule, ScheduleRun, ScheduleRunStatus,
};
use crate::schedule::{
    apply_jitter, enumerate_due_times, next_fire_after, parse_timezone, preview_fire_times,
    schedule_idempotency_key, validate_cron, ScheduleError,
};
use crate::store::{ScheduleStore, StoreError, WorkflowStore};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("schedule {0} not found")]
    NotFound(Uuid),
}

/// Failure to hand an activation to the executor; recorded on the
/// `schedule_runs` row as FAILED.
#[derive(Debug, Error)]
#[error("launch failed: {0}")]
pub struct LaunchError(pub String);

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub workflow_id: String,
    pub version: u32,
    pub user_id: String,
    pub run_at: DateTime<Utc>,
    pub idempotency_key: String,
}

/// Seam between the scheduler and the executor.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<Uuid, LaunchError>;
}

/// The executor launches schedule activations by locating the
/// schedule-based trigger node and synthesizing a `{fired_at}` payload.
pub struct ExecutorLauncher {
    pub executor: Arc<Executor>,
    pub workflows: Arc<dyn WorkflowStore>,
}

#[async_trait]
impl RunLauncher for ExecutorLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Uuid, LaunchError> {
        let dag = self
            .workflows
            .load_dag(&request.workflow_id, request.version)
            .await
            .map_err(|e| LaunchError(e.to_string()))?
            .ok_or_else(|| {
                LaunchError(format!(
                    "workflow ({}, v{}) not found",
                    request.workflow_id, request.version
                ))
            })?;
        let trigger_node_id = dag
            .trigger_nodes()
            .find(|(_, t)| t.kind == crate::dag::TriggerKind::ScheduleBased)
            .map(|(n, _)| n.id.clone())
            .ok_or_else(|| LaunchError("workflow has no schedule-based trigger".to_string()))?;

        let payload = json!({"fired_at": request.run_at.to_rfc3339()});
        self.executor
            .start_detached(
                Arc::new(dag),
                &trigger_node_id,
                payload,
                RunSource::Schedule,
                &request.user_id,
            )
            .await
            .map_err(|e: ExecError| LaunchError(e.to_string()))
    }
}

/// Guards the tick scan. The default single-instance lock always grants.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    async fn try_acquire(&self, ttl: Duration) -> bool;
    async fn release(&self);
}

pub struct SingleInstanceLock;

#[async_trait]
impl LeaderLock for SingleInstanceLock {
    async fn try_acquire(&self, _ttl: Duration) -> bool {
        true
    }

    async fn release(&self) {}
}

// ---------------------------------------------------------------------------
// Schedule CRUD
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UpsertScheduleInput {
    pub schedule_id: Option<Uuid>,
    pub workflow_id: String,
    pub version: u32,
    pub user_id: String,
    pub cron_expr: String,
    pub timezone: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub jitter_ms: Option<u64>,
    pub overlap_policy: Option<OverlapPolicy>,
    pub catchup_policy: Option<CatchupPolicy>,
}

#[derive(Debug, Clone)]
pub struct SchedulePreview {
    pub schedule: Schedule,
    pub next_fire_times: Vec<DateTime<Utc>>,
}

pub struct SchedulerService {
    store: Arc<dyn ScheduleStore>,
    launcher: Arc<dyn RunLauncher>,
    leader: Arc<dyn LeaderLock>,
    /// When present, ENQUEUED/STARTED emissions are reconciled against run
    /// status every tick.
    runs: Option<Arc<dyn crate::store::RunStore>>,
    config: Config,
}

impl SchedulerService {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        launcher: Arc<dyn RunLauncher>,
        leader: Arc<dyn LeaderLock>,
        config: Config,
    ) -> Self {
        Self {
            store,
            launcher,
            leader,
            runs: None,
            config,
        }
    }

    pub fn with_run_store(mut self, runs: Arc<dyn crate::store::RunStore>) -> Self {
        self.runs = Some(runs);
        self
    }

    /// Validate cron and timezone, precompute `next_run_at`, and persist.
    pub async fn upsert_schedule(
        &self,
        input: UpsertScheduleInput,
    ) -> Result<Schedule, SchedulerError> {
        validate_cron(&input.cron_expr)?;
        parse_timezone(&input.timezone)?;

        let now = Utc::now();
        let from = input.start_at.filter(|s| *s > now).unwrap_or(now);
        let next_run_at = next_fire_after(&input.cron_expr, &input.timezone, from)?
            .unwrap_or(from);

        let schedule = Schedule {
            schedule_id: input.schedule_id.unwrap_or_else(Uuid::new_v4),
            workflow_id: input.workflow_id,
            version: input.version,
            user_id: input.user_id,
            cron_expr: input.cron_expr,
            timezone: input.timezone,
            start_at: input.start_at,
            end_at: input.end_at,
            next_run_at,
            paused: false,
            jitter_ms: input.jitter_ms.unwrap_or(self.config.default_jitter_ms),
            overlap_policy: input
                .overlap_policy
                .unwrap_or(self.config.default_overlap_policy),
            catchup_policy: input
                .catchup_policy
                .unwrap_or(self.config.default_catchup_policy),
            updated_at: now,
        };
        self.store.upsert_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule.schedule_id,
            cron = %schedule.cron_expr,
            timezone = %schedule.timezone,
            next_run_at = %schedule.next_run_at,
            "schedule upserted"
        );
        Ok(schedule)
    }

    pub async fn pause_schedule(&self, schedule_id: Uuid, paused: bool) -> Result<(), SchedulerError> {
        self.store.set_paused(schedule_id, paused).await?;
        Ok(())
    }

    pub async fn delete_schedule(&self, schedule_id: Uuid) -> Result<(), SchedulerError> {
        self.store.delete_schedule(schedule_id).await?;
        Ok(())
    }

    /// Fetch a schedule plus its next five fire times.
    pub async fn get_schedule(&self, schedule_id: Uuid) -> Result<SchedulePreview, SchedulerError> {
        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or(SchedulerError::NotFound(schedule_id))?;
        let next_fire_times =
            preview_fire_times(&schedule.cron_expr, &schedule.timezone, Utc::now(), 5)?;
        Ok(SchedulePreview {
            schedule,
            next_fire_times,
        })
    }

    // -----------------------------------------------------------------------
    // Tick loop
    // -----------------------------------------------------------------------

    /// Spawn the background tick worker.
    pub fn start(self: Arc<Self>) -> SchedulerWorker {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let service = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(service.config.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                tick_ms = service.config.tick_ms,
                lookahead_ms = service.config.lookahead_ms,
                "scheduler worker started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = service.run_tick(Utc::now()).await {
                            error!(?err, "tick failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() && *shutdown_rx.borrow() {
                            info!("scheduler worker shutting down");
                            break;
                        }
                    }
                }
            }
        });
        SchedulerWorker {
            shutdown_tx,
            handle,
        }
    }

    /// One full scan. Public so tests can drive virtual time.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if !self
            .leader
            .try_acquire(self.config.tick_interval() * 3)
            .await
        {
            debug!("not the leader this tick");
            return Ok(());
        }

        self.reconcile_inflight().await?;

        let horizon = now + chrono::Duration::milliseconds(self.config.lookahead_ms as i64);
        let due = self.store.due_schedules(horizon).await?;
        if !due.is_empty() {
            debug!(count = due.len(), "processing due schedules");
        }
        for schedule in due {
            if let Err(err) = self.process_schedule(&schedule, now).await {
                error!(schedule_id = %schedule.schedule_id, ?err, "schedule processing failed");
            }
        }

        self.leader.release().await;
        Ok(())
    }

    /// Move emissions whose run reached a terminal status out of the
    /// in-flight set, so overlap policies see fresh state.
    async fn reconcile_inflight(&self) -> Result<(), SchedulerError> {
        let Some(runs) = &self.runs else {
            return Ok(());
        };
        for emission in self.store.list_inflight_runs().await? {
            let Some(run_id) = emission.run_id else { continue };
            let Some(run) = runs
                .get_run(run_id)
                .await
                .map_err(SchedulerError::Store)?
            else {
                continue;
            };
            let terminal = match run.status {
                crate::run_state::RunStatus::Success => Some(ScheduleRunStatus::Success),
                crate::run_state::RunStatus::Failed => Some(ScheduleRunStatus::Failed),
                crate::run_state::RunStatus::Running => None,
            };
            if let Some(status) = terminal {
                self.store
                    .update_schedule_run_status(&emission.idempotency_key, status, Some(run_id))
                    .await?;
            }
        }
        Ok(())
    }

    async fn process_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let times = enumerate_due_times(
            &schedule.cron_expr,
            &schedule.timezone,
            schedule.next_run_at,
            now,
            self.config.lookahead_ms,
            schedule.catchup_policy,
        )?;
        if times.is_empty() {
            // Nothing due inside the window; move the cursor forward so the
            // same empty window is not rescanned forever.
            if let Some(next) =
                next_fire_after(&schedule.cron_expr, &schedule.timezone, now)?
            {
                if next != schedule.next_run_at {
                    self.store
                        .update_next_run_at(schedule.schedule_id, next)
                        .await?;
                }
            }
            return Ok(());
        }

        // Catchup bound: excess times carry over to later ticks.
        let capped: Vec<DateTime<Utc>> = times
            .iter()
            .copied()
            .take(self.config.max_catchup_per_tick)
            .collect();
        let overflowed = times.len() > capped.len();
        if overflowed {
            warn!(
                schedule_id = %schedule.schedule_id,
                total = times.len(),
                cap = self.config.max_catchup_per_tick,
                "catchup overflow; deferring excess fire times"
            );
        }

        let mut last_consumed: Option<DateTime<Utc>> = None;
        let mut deferred = false;
        for run_at in &capped {
            match self.process_run_time(schedule, *run_at, now).await? {
                Emission::Deferred => {
                    // Overlap policy queue: stop emitting this tick and keep
                    // next_run_at pointed at the deferred instant.
                    deferred = true;
                    break;
                }
                Emission::Consumed => {
                    last_consumed = Some(*run_at);
                }
            }
        }

        // Advance past everything consumed this tick.
        if !deferred {
            let last_considered = match (overflowed, last_consumed) {
                // With overflow, resume exactly at the first deferred time.
                (true, Some(last)) => last,
                (true, None) => return Ok(()),
                (false, Some(last)) => last.max(now),
                (false, None) => now,
            };
            if let Some(next) = next_fire_after(
                &schedule.cron_expr,
                &schedule.timezone,
                last_considered,
            )? {
                self.store
                    .update_next_run_at(schedule.schedule_id, next)
                    .await?;
            }
        } else if let Some(last) = last_consumed {
            if let Some(next) =
                next_fire_after(&schedule.cron_expr, &schedule.timezone, last)?
            {
                self.store
                    .update_next_run_at(schedule.schedule_id, next)
                    .await?;
            }
        }
        Ok(())
    }

    async fn process_run_time(
        &self,
        schedule: &Schedule,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Emission, SchedulerError> {
        let idem = schedule_idempotency_key(&schedule.schedule_id.to_string(), run_at);

        // The exactly-once guard: a row for this instant means a previous
        // tick (or instance) already handled it.
        if self.store.get_schedule_run(&idem).await?.is_some() {
            return Ok(Emission::Consumed);
        }

        if schedule.overlap_policy != OverlapPolicy::Allow
            && self.store.has_inflight_runs(schedule.schedule_id).await?
        {
            match schedule.overlap_policy {
                OverlapPolicy::Skip => {
                    self.insert_schedule_run(schedule, run_at, &idem, ScheduleRunStatus::Skipped, None)
                        .await?;
                    info!(schedule_id = %schedule.schedule_id, %run_at, "skipped (overlap)");
                    return Ok(Emission::Consumed);
                }
                OverlapPolicy::Queue => {
                    debug!(schedule_id = %schedule.schedule_id, %run_at, "queued (overlap)");
                    return Ok(Emission::Deferred);
                }
                OverlapPolicy::Allow => unreachable!(),
            }
        }

        let fire_at = apply_jitter(run_at, schedule.jitter_ms, &mut rand::rng());
        if fire_at > now {
            // Future fire: claim the instant first (the idempotency row is
            // the only exactly-once guard), then arm an in-process timer.
            self.insert_schedule_run(schedule, run_at, &idem, ScheduleRunStatus::Enqueued, None)
                .await?;
            self.spawn_deferred_fire(schedule.clone(), run_at, fire_at, idem);
            return Ok(Emission::Consumed);
        }

        self.fire(schedule, run_at, &idem).await?;
        Ok(Emission::Consumed)
    }

    /// Launch with bounded retry, then record the emission.
    async fn fire(
        &self,
        schedule: &Schedule,
        run_at: DateTime<Utc>,
        idem: &str,
    ) -> Result<(), SchedulerError> {
        const ENQUEUE_ATTEMPTS: u32 = 3;
        const ENQUEUE_BACKOFF_MS: u64 = 1_000;

        let request = LaunchRequest {
            workflow_id: schedule.workflow_id.clone(),
            version: schedule.version,
            user_id: schedule.user_id.clone(),
            run_at,
            idempotency_key: idem.to_string(),
        };

        let mut launched = None;
        for attempt in 1..=ENQUEUE_ATTEMPTS {
            match self.launcher.launch(request.clone()).await {
                Ok(run_id) => {
                    launched = Some(run_id);
                    break;
                }
                Err(err) => {
                    warn!(
                        schedule_id = %schedule.schedule_id,
                        attempt,
                        %err,
                        "launch attempt failed"
                    );
                    if attempt < ENQUEUE_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(ENQUEUE_BACKOFF_MS * attempt as u64))
                            .await;
                    }
                }
            }
        }

        match launched {
            Some(run_id) => {
                self.insert_schedule_run(
                    schedule,
                    run_at,
                    idem,
                    ScheduleRunStatus::Enqueued,
                    Some(run_id),
                )
                .await?;
                info!(schedule_id = %schedule.schedule_id, %run_at, %run_id, "fired");
            }
            None => {
                self.insert_schedule_run(schedule, run_at, idem, ScheduleRunStatus::Failed, None)
                    .await?;
                error!(schedule_id = %schedule.schedule_id, %run_at, "launch failed; next cron time is the next chance");
            }
        }
        Ok(())
    }

    fn spawn_deferred_fire(
        &self,
        schedule: Schedule,
        run_at: DateTime<Utc>,
        fire_at: DateTime<Utc>,
        idem: String,
    ) {
        let store = Arc::clone(&self.store);
        let launcher = Arc::clone(&self.launcher);
        tokio::spawn(async move {
            let delay = (fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;

            // The planned row must still be pending (not already fired by a
            // takeover or superseded by a delete).
            match store.get_schedule_run(&idem).await {
                Ok(Some(row)) if row.status == ScheduleRunStatus::Enqueued && row.run_id.is_none() => {}
                _ => return,
            }
            let request = LaunchRequest {
                workflow_id: schedule.workflow_id.clone(),
                version: schedule.version,
                user_id: schedule.user_id.clone(),
                run_at,
                idempotency_key: idem.clone(),
            };
            let (status, run_id) = match launcher.launch(request).await {
                Ok(run_id) => (ScheduleRunStatus::Started, Some(run_id)),
                Err(err) => {
                    error!(schedule_id = %schedule.schedule_id, %err, "deferred launch failed");
                    (ScheduleRunStatus::Failed, None)
                }
            };
            let _ = store
                .update_schedule_run_status(&idem, status, run_id)
                .await;
        });
    }

    async fn insert_schedule_run(
        &self,
        schedule: &Schedule,
        run_at: DateTime<Utc>,
        idem: &str,
        status: ScheduleRunStatus,
        run_id: Option<Uuid>,
    ) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let inserted = self
            .store
            .insert_schedule_run(&ScheduleRun {
                idempotency_key: idem.to_string(),
                schedule_id: schedule.schedule_id,
                run_at,
                status,
                run_id,
                created_at: now,
                updated_at: now,
            })
            .await?;
        if !inserted {
            // Another instance won the insert race; the key did its job.
            debug!(schedule_id = %schedule.schedule_id, %run_at, "duplicate emission suppressed");
        }
        Ok(())
    }
}

enum Emission {
    Consumed,
    Deferred,
}

/// Handle to the background tick task.
pub struct SchedulerWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerWorker {
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.trigger_shutdown();
        let _ = self.handle.await;
    }
}
