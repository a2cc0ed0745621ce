//! DAG executor.
//!
//! Drives one activated run to a terminal status. The dispatch loop is
//! single-threaded per run: one worker owns a run's state under a lease,
//! and suspension happens only at invoker calls, backoff sleeps, join
//! waits, and foreach shard synchronization. Multiple runs execute
//! concurrently in separate tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::ast_evaluator::{self, EvalError};
use crate::dag::{Dag, DagError, DagIndex, Edge, EdgeWhen, JoinMode, Node, NodeData};
use crate::idempotency::{action_idem_key, args_digest, IdempotencyCache};
use crate::invoker::{InvokeRequest, ToolInvoker};
use crate::retry::RetryPolicy;
use crate::run_state::{
    slim_result, extract_path, NodeExecution, NodeStatus, RunContext, RunSource, RunStatus,
    WorkflowRun,
};
use crate::store::{current_attempts, RunStore, StoreError, WorkflowStore};
use crate::triggers::{EventDelivery, TriggerIndex};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workflow ({0}, v{1}) not found")]
    WorkflowNotFound(String, u32),

    #[error("trigger node '{0}' not found in DAG")]
    TriggerNotFound(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {0} lease is held by another worker")]
    LeaseHeld(Uuid),

    #[error("invalid DAG: {0}")]
    Dag(#[from] DagError),
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Retry policy for actions that declare none (and no global default).
    pub default_retry: RetryPolicy,
    pub default_timeout_ms: u64,
    pub max_retry_delay_ms: u64,
    pub lease_ttl: Duration,
    pub worker_id: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            default_timeout_ms: 45_000,
            max_retry_delay_ms: 30_000,
            lease_ttl: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

pub struct Executor {
    workflows: Arc<dyn WorkflowStore>,
    runs: Arc<dyn RunStore>,
    invoker: Arc<dyn ToolInvoker>,
    cache: Arc<IdempotencyCache>,
    config: ExecutorConfig,
    cancellations: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl Executor {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        runs: Arc<dyn RunStore>,
        invoker: Arc<dyn ToolInvoker>,
        cache: Arc<IdempotencyCache>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            workflows,
            runs,
            invoker,
            cache,
            config,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Request cooperative cancellation of a run.
    pub fn cancel(&self, run_id: Uuid) {
        let cancellations = self.cancellations.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = cancellations.get(&run_id) {
            let _ = tx.send(true);
        }
    }

    /// Resolve an event delivery and start the bound workflow. Returns
    /// `None` when the delivery resolves to no trigger instance.
    pub async fn activate_event(
        &self,
        index: &TriggerIndex,
        delivery: EventDelivery,
    ) -> Result<Option<Uuid>, ExecError> {
        let Some(binding) = index.resolve(&delivery) else {
            warn!(
                toolkit = %delivery.toolkit_slug,
                trigger = %delivery.trigger_slug,
                "discarding delivery: no trigger instance"
            );
            return Ok(None);
        };
        let dag = self
            .workflows
            .load_dag(&binding.workflow_id, binding.version)
            .await?
            .ok_or_else(|| {
                ExecError::WorkflowNotFound(binding.workflow_id.clone(), binding.version)
            })?;
        let run_id = self
            .start(
                Arc::new(dag),
                &binding.node_id,
                delivery.payload,
                RunSource::Event,
                "system",
            )
            .await?;
        Ok(Some(run_id))
    }

    /// Create a run from an activation and drive it to a terminal status.
    #[instrument(skip(self, dag, payload), fields(workflow_id = %dag.workflow_id))]
    pub async fn start(
        &self,
        dag: Arc<Dag>,
        trigger_node_id: &str,
        payload: Value,
        source: RunSource,
        user_id: &str,
    ) -> Result<Uuid, ExecError> {
        let (run_id, index, state) = self
            .prepare(&dag, trigger_node_id, payload, source, user_id)
            .await?;
        self.drive(&dag, &index, state).await?;
        Ok(run_id)
    }

    /// Create a run and drive it in a background task; returns as soon as
    /// the activation is accepted.
    pub async fn start_detached(
        self: &Arc<Self>,
        dag: Arc<Dag>,
        trigger_node_id: &str,
        payload: Value,
        source: RunSource,
        user_id: &str,
    ) -> Result<Uuid, ExecError> {
        let (run_id, index, state) = self
            .prepare(&dag, trigger_node_id, payload, source, user_id)
            .await?;
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = executor.drive(&dag, &index, state).await {
                error!(run_id = %run_id, ?err, "detached run failed to drive");
            }
        });
        Ok(run_id)
    }

    /// Persist the run record, finalize the trigger node, and seed the
    /// ready queue with the trigger's successors.
    async fn prepare(
        &self,
        dag: &Dag,
        trigger_node_id: &str,
        payload: Value,
        source: RunSource,
        user_id: &str,
    ) -> Result<(Uuid, DagIndex, DriveState), ExecError> {
        if dag.node(trigger_node_id).is_none() {
            return Err(ExecError::TriggerNotFound(trigger_node_id.to_string()));
        }
        let index = dag.index()?;

        let run_id = Uuid::new_v4();
        let run = WorkflowRun {
            run_id,
            workflow_id: dag.workflow_id.clone(),
            version: dag.version,
            user_id: user_id.to_string(),
            status: RunStatus::Running,
            source,
            started_at: Utc::now(),
            finished_at: None,
            trigger_digest: args_digest(&payload),
        };
        self.runs.create_run(&run).await?;
        info!(run_id = %run_id, source = source.as_str(), "run created");

        let globals = dag
            .globals
            .as_ref()
            .map(|g| g.vars.clone())
            .unwrap_or_default();
        let mut state = DriveState::new(run_id, RunContext::new(payload, globals));

        state.node_state.insert(trigger_node_id.to_string(), NodeStatus::Skipped);
        self.persist_execution(&state, trigger_node_id, 1, NodeStatus::Skipped, None, None)
            .await?;
        for &edge_idx in index.outgoing(trigger_node_id) {
            let edge = &dag.edges[edge_idx];
            state.ready.push_back(ReadyItem {
                node_id: edge.target.clone(),
                from: Some(trigger_node_id.to_string()),
            });
        }

        Ok((run_id, index, state))
    }

    /// Take over an existing run after a crash or lease expiry, replaying
    /// persisted node executions.
    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: Uuid) -> Result<(), ExecError> {
        let run = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or(ExecError::RunNotFound(run_id))?;
        if run.status != RunStatus::Running {
            debug!(run_id = %run_id, status = run.status.as_str(), "run already terminal");
            return Ok(());
        }
        let dag = self
            .workflows
            .load_dag(&run.workflow_id, run.version)
            .await?
            .ok_or_else(|| ExecError::WorkflowNotFound(run.workflow_id.clone(), run.version))?;
        let index = dag.index()?;

        let executions = self.runs.node_executions(run_id).await?;
        let current = current_attempts(&executions);

        // Rebuild in-memory state from the persisted rows. Inputs are not
        // persisted per-run beyond the trigger digest, so takeover replays
        // with the outputs recorded so far.
        let globals = dag
            .globals
            .as_ref()
            .map(|g| g.vars.clone())
            .unwrap_or_default();
        let mut state = DriveState::new(run_id, RunContext::new(Value::Null, globals));
        for (node_id, execution) in &current {
            state.node_state.insert(node_id.clone(), execution.status);
            state.attempts.insert(node_id.clone(), execution.attempt);
            if execution.status == NodeStatus::Done {
                if let Some(output) = &execution.output_ref {
                    state.ctx.node_outputs.insert(node_id.clone(), output.clone());
                    if let Some(node) = dag.node(base_node_id(node_id)) {
                        if let NodeData::Action(action) = &node.data {
                            extract_output_vars(&mut state.ctx, action, output);
                        }
                    }
                }
            }
            if execution.status == NodeStatus::Error {
                state
                    .ctx
                    .errors
                    .insert(node_id.clone(), execution.error.clone().unwrap_or_default());
            }
        }

        // Frontier: anything RUNNING is re-dispatched under the same idem
        // key; the cache absorbs duplicates. Final nodes re-route so
        // successors that never started get enqueued (the final guard skips
        // anything already done).
        for (node_id, execution) in &current {
            match execution.status {
                NodeStatus::Running | NodeStatus::Pending => {
                    state.node_state.remove(node_id);
                    state.ready.push_back(ReadyItem {
                        node_id: node_id.clone(),
                        from: None,
                    });
                }
                NodeStatus::Done | NodeStatus::Error => {
                    self.route_successors(&dag, &index, &mut state, node_id, execution.status)
                        .await?;
                }
                NodeStatus::Skipped => {
                    if dag
                        .node(base_node_id(node_id))
                        .is_some_and(|n| matches!(n.data, NodeData::Trigger(_)))
                    {
                        for &edge_idx in index.outgoing(base_node_id(node_id)) {
                            let edge = &dag.edges[edge_idx];
                            state.ready.push_back(ReadyItem {
                                node_id: edge.target.clone(),
                                from: Some(node_id.clone()),
                            });
                        }
                    }
                }
            }
        }

        info!(run_id = %run_id, frontier = state.ready.len(), "resuming run");
        self.drive(&dag, &index, state).await
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        dag: &Dag,
        index: &DagIndex,
        mut state: DriveState,
    ) -> Result<(), ExecError> {
        let run_id = state.run_id;
        if !self
            .runs
            .acquire_run_lease(run_id, &self.config.worker_id, self.config.lease_ttl)
            .await?
        {
            return Err(ExecError::LeaseHeld(run_id));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut cancellations = self.cancellations.lock().unwrap_or_else(|e| e.into_inner());
            cancellations.insert(run_id, cancel_tx);
        }

        let deadline = dag
            .globals
            .as_ref()
            .and_then(|g| g.run_timeout_ms)
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let result = self
            .dispatch_loop(dag, index, &mut state, cancel_rx, deadline)
            .await;

        {
            let mut cancellations = self.cancellations.lock().unwrap_or_else(|e| e.into_inner());
            cancellations.remove(&run_id);
        }

        let finalize = self.finalize(dag, index, &mut state).await;
        self.runs
            .release_run_lease(run_id, &self.config.worker_id)
            .await?;
        result.and(finalize)
    }

    /// Process ready nodes until the queue drains or the run is cut short.
    async fn dispatch_loop(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        cancel_rx: watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Result<(), ExecError> {
        while let Some(item) = state.ready.pop_front() {
            if *cancel_rx.borrow() {
                state.cut_short = Some("cancelled");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                state.cut_short = Some("timeout");
                break;
            }
            if state
                .node_state
                .get(&item.node_id)
                .is_some_and(NodeStatus::is_final)
            {
                continue;
            }
            let _ = self
                .runs
                .renew_run_lease(state.run_id, &self.config.worker_id, self.config.lease_ttl)
                .await?;
            self.process_node(dag, index, state, item, &cancel_rx, deadline)
                .await?;
        }
        if state.cut_short.is_some() {
            state.ready.clear();
        }
        Ok(())
    }

    async fn process_node(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        item: ReadyItem,
        cancel_rx: &watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Result<(), ExecError> {
        let base_id = base_node_id(&item.node_id).to_string();
        let Some(node) = dag.node(&base_id) else {
            warn!(node_id = %item.node_id, "ready queue referenced unknown node");
            return Ok(());
        };
        debug!(run_id = %state.run_id, node_id = %item.node_id, node_type = node.data.type_name(), "processing node");

        match &node.data {
            NodeData::Trigger(_) => {
                state.mark(&item.node_id, NodeStatus::Skipped);
                self.persist_execution(state, &item.node_id, 1, NodeStatus::Skipped, None, None)
                    .await?;
                Ok(())
            }
            NodeData::Action(_) => {
                self.exec_action(dag, index, state, node, &item, cancel_rx, deadline)
                    .await
            }
            NodeData::GatewayIf(data) => {
                let data = data.clone();
                self.exec_gateway_if(dag, index, state, &item, &data).await
            }
            NodeData::GatewaySwitch(data) => {
                let data = data.clone();
                self.exec_gateway_switch(dag, index, state, &item, &data).await
            }
            NodeData::Parallel(_) => {
                let fanout = index.outgoing(&base_id).len();
                state
                    .ctx
                    .node_outputs
                    .insert(item.node_id.clone(), json!({"fanout": fanout}));
                state.mark(&item.node_id, NodeStatus::Done);
                let attempt = state.next_attempt(&item.node_id);
                self.persist_execution(
                    state,
                    &item.node_id,
                    attempt,
                    NodeStatus::Done,
                    Some(json!({"fanout": fanout})),
                    None,
                )
                .await?;
                self.route_successors(dag, index, state, &item.node_id, NodeStatus::Done)
                    .await
            }
            NodeData::Join(data) => {
                let mode = data.mode;
                self.exec_join(dag, index, state, &item, mode).await
            }
            NodeData::LoopWhile(data) => {
                let data = data.clone();
                self.exec_loop_while(dag, index, state, &item, &data).await
            }
            NodeData::LoopForeach(data) => {
                let data = data.clone();
                self.exec_loop_foreach(dag, index, state, &item, &data, cancel_rx, deadline)
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Node handlers
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn exec_action(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        node: &Node,
        item: &ReadyItem,
        cancel_rx: &watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Result<(), ExecError> {
        let NodeData::Action(action) = &node.data else {
            unreachable!("exec_action on non-action node");
        };
        let scoped_id = &item.node_id;

        // Render arguments against the current context. Rendering is
        // deterministic, so a failure is fatal for the node.
        let rendered = crate::template::render_template(&action.input_template, &state.ctx.scope());
        let rendered = match rendered {
            Ok(rendered) => rendered,
            Err(e) => {
                return self
                    .fail_node(dag, index, state, scoped_id, e.to_string())
                    .await;
            }
        };

        let idem_key = action_idem_key(&state.run_id.to_string(), scoped_id, &rendered);
        if let Some(cached) = self.cache.get(&idem_key) {
            debug!(node_id = %scoped_id, "idempotency cache hit; skipping invocation");
            let attempt = state.next_attempt(scoped_id);
            self.complete_action(dag, index, state, action, scoped_id, attempt, cached, &idem_key)
                .await?;
            return Ok(());
        }

        let retry = action
            .retry
            .unwrap_or(self.config.default_retry);
        let timeout_ms = action.timeout_ms.unwrap_or(self.config.default_timeout_ms);

        // Persisted attempt numbers are monotone across loop iterations;
        // the retry budget is per dispatch.
        let mut attempt_in_dispatch: u32 = 1;
        let mut attempt = state.next_attempt(scoped_id);
        loop {
            state.mark(scoped_id, NodeStatus::Running);
            self.persist_execution(
                state,
                scoped_id,
                attempt,
                NodeStatus::Running,
                None,
                Some(idem_key.clone()),
            )
            .await?;

            let request = InvokeRequest {
                tool: action.tool.clone(),
                action: action.action.clone(),
                connection_id: action.connection_id.clone(),
                arguments: rendered.clone(),
                timeout_ms,
                idempotency_key: idem_key.clone(),
            };

            let outcome = match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.invoker.invoke(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(crate::invoker::InvokeError::retriable(format!(
                    "invocation exceeded {timeout_ms} ms"
                ))),
            };

            match outcome {
                Ok(result) => {
                    let slim = slim_result(&result);
                    self.cache.put(&idem_key, slim.clone());
                    state.ctx.artifacts.insert(scoped_id.clone(), result);
                    self.complete_action(dag, index, state, action, scoped_id, attempt, slim, &idem_key)
                        .await?;
                    return Ok(());
                }
                Err(invoke_err) => {
                    let exhausted = attempt_in_dispatch >= retry.max_attempts();
                    if !invoke_err.is_retriable() || exhausted {
                        let reason = if exhausted && invoke_err.is_retriable() {
                            format!("retries exhausted: {}", invoke_err.message)
                        } else {
                            invoke_err.message.clone()
                        };
                        return self.fail_node(dag, index, state, scoped_id, reason).await;
                    }

                    let delay = retry
                        .delay_for_attempt(attempt_in_dispatch, self.config.max_retry_delay_ms);
                    warn!(
                        node_id = %scoped_id,
                        attempt = attempt_in_dispatch,
                        delay_ms = delay,
                        error = %invoke_err.message,
                        "retriable failure; backing off"
                    );
                    let mut cancel = cancel_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        _ = cancel.changed() => {
                            return self
                                .fail_node(dag, index, state, scoped_id, "cancelled".to_string())
                                .await;
                        }
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return self
                            .fail_node(dag, index, state, scoped_id, "timeout".to_string())
                            .await;
                    }
                    attempt_in_dispatch += 1;
                    attempt = state.next_attempt(scoped_id);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_action(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        action: &crate::dag::ActionData,
        scoped_id: &str,
        attempt: u32,
        slim: Value,
        idem_key: &str,
    ) -> Result<(), ExecError> {
        extract_output_vars(&mut state.ctx, action, &slim);
        state.ctx.node_outputs.insert(scoped_id.to_string(), slim.clone());
        state.mark(scoped_id, NodeStatus::Done);
        self.persist_execution(
            state,
            scoped_id,
            attempt,
            NodeStatus::Done,
            Some(slim),
            Some(idem_key.to_string()),
        )
        .await?;
        self.route_successors(dag, index, state, scoped_id, NodeStatus::Done)
            .await
    }

    async fn exec_gateway_if(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        item: &ReadyItem,
        data: &crate::dag::GatewayIfData,
    ) -> Result<(), ExecError> {
        let mut chosen: Option<String> = None;
        for branch in &data.branches {
            let verdict = ast_evaluator::eval_bool(&branch.expr, &state.ctx.scope());
            match verdict {
                Ok(true) => {
                    chosen = Some(branch.to.clone());
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    return self
                        .fail_node(dag, index, state, &item.node_id, eval_failure(&branch.expr, &e))
                        .await;
                }
            }
        }
        let target = chosen.or_else(|| data.else_to.clone());

        let output = json!({"branch": target});
        state.ctx.node_outputs.insert(item.node_id.clone(), output.clone());
        state.mark(&item.node_id, NodeStatus::Done);
        let attempt = state.next_attempt(&item.node_id);
        self.persist_execution(state, &item.node_id, attempt, NodeStatus::Done, Some(output), None)
            .await?;

        if let Some(target) = target {
            state.ready.push_back(ReadyItem {
                node_id: scoped_sibling(&item.node_id, &target),
                from: Some(item.node_id.clone()),
            });
        }
        Ok(())
    }

    async fn exec_gateway_switch(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        item: &ReadyItem,
        data: &crate::dag::GatewaySwitchData,
    ) -> Result<(), ExecError> {
        let evaluated = ast_evaluator::eval_str(&data.selector, &state.ctx.scope());
        let selector_value = match evaluated {
            Ok(value) => value,
            Err(e) => {
                return self
                    .fail_node(dag, index, state, &item.node_id, eval_failure(&data.selector, &e))
                    .await;
            }
        };

        let target = data
            .cases
            .iter()
            .find(|case| case.value == selector_value)
            .map(|case| case.to.clone())
            .or_else(|| data.default_to.clone());

        let output = json!({"case": selector_value, "to": target});
        state.ctx.node_outputs.insert(item.node_id.clone(), output.clone());
        state.mark(&item.node_id, NodeStatus::Done);
        let attempt = state.next_attempt(&item.node_id);
        self.persist_execution(state, &item.node_id, attempt, NodeStatus::Done, Some(output), None)
            .await?;

        if let Some(target) = target {
            state.ready.push_back(ReadyItem {
                node_id: scoped_sibling(&item.node_id, &target),
                from: Some(item.node_id.clone()),
            });
        }
        Ok(())
    }

    async fn exec_join(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        item: &ReadyItem,
        mode: JoinMode,
    ) -> Result<(), ExecError> {
        let Some(from) = &item.from else {
            // A join re-dispatched without a source (resume); re-check.
            return self.check_join(dag, index, state, &item.node_id, mode, 0).await;
        };
        let arrived = self
            .runs
            .record_join_arrival(state.run_id, &item.node_id, from)
            .await?;
        self.check_join(dag, index, state, &item.node_id, mode, arrived)
            .await
    }

    async fn check_join(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        scoped_id: &str,
        mode: JoinMode,
        mut arrived: usize,
    ) -> Result<(), ExecError> {
        if arrived == 0 {
            arrived = self
                .runs
                .join_arrivals(state.run_id, scoped_id)
                .await?
                .len();
        }
        let in_degree = index.in_degree(base_node_id(scoped_id));
        let satisfied = match mode {
            JoinMode::All => arrived >= in_degree,
            JoinMode::Any => arrived >= 1,
            JoinMode::Quorum(n) => arrived >= n as usize,
        };
        debug!(
            node_id = %scoped_id,
            arrived,
            in_degree,
            mode = %mode,
            satisfied,
            "join arrival"
        );
        if !satisfied {
            // Stay pending; a later arrival re-enqueues this join.
            state.mark(scoped_id, NodeStatus::Pending);
            return Ok(());
        }

        let output = json!({"arrived": arrived});
        state.ctx.node_outputs.insert(scoped_id.to_string(), output.clone());
        state.mark(scoped_id, NodeStatus::Done);
        let attempt = state.next_attempt(scoped_id);
        self.persist_execution(state, scoped_id, attempt, NodeStatus::Done, Some(output), None)
            .await?;
        self.route_successors(dag, index, state, scoped_id, NodeStatus::Done)
            .await
    }

    async fn exec_loop_while(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        item: &ReadyItem,
        data: &crate::dag::LoopWhileData,
    ) -> Result<(), ExecError> {
        let iterations = state.loop_iterations.get(&item.node_id).copied().unwrap_or(0);
        let evaluated = ast_evaluator::eval_bool(&data.condition, &state.ctx.scope());
        let condition = match evaluated {
            Ok(value) => value,
            Err(e) => {
                return self
                    .fail_node(dag, index, state, &item.node_id, eval_failure(&data.condition, &e))
                    .await;
            }
        };

        // max_iterations == 0 disables the body outright.
        if condition && data.max_iterations > 0 {
            if iterations >= data.max_iterations {
                return self
                    .fail_node(
                        dag,
                        index,
                        state,
                        &item.node_id,
                        format!("loop exceeded max_iterations={}", data.max_iterations),
                    )
                    .await;
            }
            state
                .loop_iterations
                .insert(item.node_id.clone(), iterations + 1);
            // The body can reference the 1-indexed iteration, which also
            // keeps per-iteration action arguments (and idempotency keys)
            // distinct.
            state
                .ctx
                .vars
                .insert("loop_iteration".to_string(), json!(iterations + 1));
            state.mark(&item.node_id, NodeStatus::Running);
            self.reset_loop_body(dag, index, state, &item.node_id).await?;
            state.ready.push_back(ReadyItem {
                node_id: scoped_sibling(&item.node_id, &data.body_start),
                from: Some(item.node_id.clone()),
            });
            return Ok(());
        }

        let output = json!({"iterations": iterations});
        state.ctx.node_outputs.insert(item.node_id.clone(), output.clone());
        state.mark(&item.node_id, NodeStatus::Done);
        let attempt = state.next_attempt(&item.node_id);
        self.persist_execution(state, &item.node_id, attempt, NodeStatus::Done, Some(output), None)
            .await?;
        // Exit: route every successor except the body entry.
        self.route_successors_filtered(dag, index, state, &item.node_id, NodeStatus::Done, |edge| {
            edge.target != data.body_start
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn exec_loop_foreach(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        item: &ReadyItem,
        data: &crate::dag::LoopForeachData,
        cancel_rx: &watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Result<(), ExecError> {
        let evaluated = ast_evaluator::eval_str(&data.source_array_expr, &state.ctx.scope());
        let source = match evaluated {
            Ok(value) => value,
            Err(e) => {
                return self
                    .fail_node(
                        dag,
                        index,
                        state,
                        &item.node_id,
                        eval_failure(&data.source_array_expr, &e),
                    )
                    .await;
            }
        };
        let Value::Array(items) = source else {
            return self
                .fail_node(
                    dag,
                    index,
                    state,
                    &item.node_id,
                    format!("foreach source '{}' is not an array", data.source_array_expr),
                )
                .await;
        };

        if items.is_empty() {
            let output = json!({"items": 0, "results": []});
            state.ctx.node_outputs.insert(item.node_id.clone(), output.clone());
            state.mark(&item.node_id, NodeStatus::Done);
            let attempt = state.next_attempt(&item.node_id);
            self.persist_execution(state, &item.node_id, attempt, NodeStatus::Done, Some(output), None)
                .await?;
            return self
                .route_successors_filtered(dag, index, state, &item.node_id, NodeStatus::Done, |edge| {
                    edge.target != data.body_start
                })
                .await;
        }

        state.mark(&item.node_id, NodeStatus::Running);
        let semaphore = Arc::new(Semaphore::new(data.max_concurrency.max(1)));
        let item_count = items.len();

        let shard_futures: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(shard_idx, shard_item)| {
                let semaphore = Arc::clone(&semaphore);
                let mut shard_ctx = state.ctx.clone();
                shard_ctx.vars.insert("item".to_string(), shard_item);
                shard_ctx
                    .vars
                    .insert("item_index".to_string(), json!(shard_idx));
                let scope = format!("{}:{shard_idx}", state.scope.as_deref().unwrap_or_default());
                let body_start = data.body_start.clone();
                let loop_id = item.node_id.clone();
                let run_id = state.run_id;
                let cancel = cancel_rx.clone();
                async move {
                    let _permit = semaphore.acquire().await;
                    self.run_shard(
                        dag, index, run_id, shard_ctx, scope, body_start, loop_id, cancel, deadline,
                    )
                    .await
                }
            })
            .collect();

        let shard_results = join_all(shard_futures).await;

        let mut results = Vec::with_capacity(item_count);
        let mut first_failure: Option<String> = None;
        for (i, shard) in shard_results.into_iter().enumerate() {
            match shard {
                Ok(ShardOutcome { result, error: None }) => results.push(result.unwrap_or(Value::Null)),
                Ok(ShardOutcome { error: Some(e), .. }) => {
                    results.push(Value::Null);
                    first_failure.get_or_insert(format!("shard {i}: {e}"));
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(reason) = first_failure {
            return self.fail_node(dag, index, state, &item.node_id, reason).await;
        }

        let output = json!({"items": item_count, "results": results});
        state.ctx.node_outputs.insert(item.node_id.clone(), output.clone());
        state.mark(&item.node_id, NodeStatus::Done);
        let attempt = state.next_attempt(&item.node_id);
        self.persist_execution(state, &item.node_id, attempt, NodeStatus::Done, Some(output), None)
            .await?;
        self.route_successors_filtered(dag, index, state, &item.node_id, NodeStatus::Done, |edge| {
            edge.target != data.body_start
        })
        .await
    }

    /// Run one foreach shard: a scoped dispatch loop over the body
    /// subgraph. Boxed because shards may contain nested foreach nodes.
    #[allow(clippy::too_many_arguments)]
    fn run_shard<'a>(
        &'a self,
        dag: &'a Dag,
        index: &'a DagIndex,
        run_id: Uuid,
        ctx: RunContext,
        scope: String,
        body_start: String,
        loop_id: String,
        cancel_rx: watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<ShardOutcome, ExecError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = DriveState::new(run_id, ctx);
            state.scope = Some(scope.clone());
            state.ready.push_back(ReadyItem {
                node_id: format!("{body_start}{scope}"),
                from: Some(loop_id),
            });
            self.dispatch_loop(dag, index, &mut state, cancel_rx, deadline)
                .await?;

            let unhandled = state.unhandled_errors();
            let error = unhandled.first().map(|(node, reason)| format!("{node}: {reason}"));
            // The shard result is the output of the last body node to finish.
            let result = state.last_output.clone();
            Ok(ShardOutcome { result, error })
        })
    }

    // -----------------------------------------------------------------------
    // Routing, failure, finalization
    // -----------------------------------------------------------------------

    async fn fail_node(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        scoped_id: &str,
        reason: String,
    ) -> Result<(), ExecError> {
        error!(run_id = %state.run_id, node_id = %scoped_id, reason = %reason, "node failed");
        state.mark(scoped_id, NodeStatus::Error);
        state.ctx.errors.insert(scoped_id.to_string(), reason.clone());
        let attempt = state.next_attempt(scoped_id);
        self.persist_execution(state, scoped_id, attempt, NodeStatus::Error, None, None)
            .await?;
        self.route_successors(dag, index, state, scoped_id, NodeStatus::Error)
            .await
    }

    async fn route_successors(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        scoped_id: &str,
        status: NodeStatus,
    ) -> Result<(), ExecError> {
        self.route_successors_filtered(dag, index, state, scoped_id, status, |_| true)
            .await
    }

    /// Enqueue eligible successors. An edge is eligible when its `when`
    /// matches the final status and its condition (if any) holds.
    async fn route_successors_filtered(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        scoped_id: &str,
        status: NodeStatus,
        keep: impl Fn(&Edge) -> bool,
    ) -> Result<(), ExecError> {
        let base_id = base_node_id(scoped_id).to_string();
        let mut routed_error_edge = false;

        for &edge_idx in index.outgoing(&base_id) {
            let edge = &dag.edges[edge_idx];
            if !keep(edge) {
                continue;
            }
            let eligible = match edge.when {
                EdgeWhen::Error => status == NodeStatus::Error,
                EdgeWhen::Success | EdgeWhen::Always => status == NodeStatus::Done,
            };
            if !eligible {
                continue;
            }
            if let Some(condition) = &edge.condition {
                match ast_evaluator::eval_bool(condition, &state.ctx.scope()) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(
                            edge_id = %edge.id,
                            error = %e,
                            "edge condition failed to evaluate; treating as false"
                        );
                        continue;
                    }
                }
            }
            if edge.when == EdgeWhen::Error {
                routed_error_edge = true;
            }
            state.ready.push_back(ReadyItem {
                node_id: scoped_sibling(scoped_id, &edge.target),
                from: Some(scoped_id.to_string()),
            });
        }

        if status == NodeStatus::Error && routed_error_edge {
            state.handled_errors.insert(scoped_id.to_string());
        }
        Ok(())
    }

    /// Clear body-node state (and body join arrivals) so a loop iteration
    /// re-executes its subgraph.
    async fn reset_loop_body(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
        loop_scoped_id: &str,
    ) -> Result<(), ExecError> {
        let base_id = base_node_id(loop_scoped_id).to_string();
        let Some(body) = index.loop_body(&base_id) else {
            return Ok(());
        };
        for body_node in body {
            let scoped = scoped_sibling(loop_scoped_id, body_node);
            state.node_state.remove(&scoped);
            state.loop_iterations.remove(&scoped);
            if dag
                .node(body_node)
                .is_some_and(|n| matches!(n.data, NodeData::Join(_)))
            {
                self.runs
                    .clear_join_arrivals(state.run_id, &scoped)
                    .await?;
            }
        }
        Ok(())
    }

    /// Terminal decision, made once when the ready queue drains: unhandled
    /// node errors or join deadlocks fail the run; untouched nodes finalize
    /// SKIPPED.
    async fn finalize(
        &self,
        dag: &Dag,
        index: &DagIndex,
        state: &mut DriveState,
    ) -> Result<(), ExecError> {
        // Foreach bodies execute under shard scopes; their base ids never
        // finalize at the root.
        let mut foreach_body: HashSet<&str> = HashSet::new();
        for node in &dag.nodes {
            if matches!(node.data, NodeData::LoopForeach(_)) {
                if let Some(body) = index.loop_body(&node.id) {
                    foreach_body.extend(body.iter().map(String::as_str));
                }
            }
        }

        // Joins with arrivals but no final status can never fire now.
        let mut deadlocked = Vec::new();
        for node in &dag.nodes {
            if !matches!(node.data, NodeData::Join(_)) || foreach_body.contains(node.id.as_str()) {
                continue;
            }
            let final_here = state
                .node_state
                .get(&node.id)
                .is_some_and(NodeStatus::is_final);
            if final_here {
                continue;
            }
            let arrivals = self.runs.join_arrivals(state.run_id, &node.id).await?;
            if !arrivals.is_empty() {
                deadlocked.push(node.id.clone());
            }
        }
        for join_id in &deadlocked {
            warn!(run_id = %state.run_id, join = %join_id, "join deadlocked");
            state.mark(join_id, NodeStatus::Error);
            state
                .ctx
                .errors
                .insert(join_id.clone(), "join cannot be satisfied".to_string());
            let attempt = state.next_attempt(join_id);
            self.persist_execution(state, join_id, attempt, NodeStatus::Error, None, None)
                .await?;
        }

        // Anything never dispatched finalizes SKIPPED.
        let reachable = {
            let trigger_ids: Vec<&str> = dag
                .trigger_nodes()
                .map(|(n, _)| n.id.as_str())
                .collect();
            index.reachable_from(dag, &trigger_ids)
        };
        for node in &dag.nodes {
            if !reachable.contains(&node.id) || foreach_body.contains(node.id.as_str()) {
                continue;
            }
            let untouched = !state
                .node_state
                .get(&node.id)
                .is_some_and(NodeStatus::is_final);
            if untouched {
                state.mark(&node.id, NodeStatus::Skipped);
                let attempt = state.next_attempt(&node.id);
                self.persist_execution(state, &node.id, attempt, NodeStatus::Skipped, None, None)
                    .await?;
            }
        }

        let failed = !state.unhandled_errors().is_empty()
            || !deadlocked.is_empty()
            || state.cut_short.is_some();
        let status = if failed { RunStatus::Failed } else { RunStatus::Success };
        self.runs
            .set_run_status(state.run_id, status, Some(Utc::now()))
            .await?;
        info!(
            run_id = %state.run_id,
            status = status.as_str(),
            reason = state.cut_short.unwrap_or("drained"),
            "run finalized"
        );
        Ok(())
    }

    async fn persist_execution(
        &self,
        state: &DriveState,
        scoped_id: &str,
        attempt: u32,
        status: NodeStatus,
        output: Option<Value>,
        idem_key: Option<String>,
    ) -> Result<(), ExecError> {
        let now = Utc::now();
        self.runs
            .upsert_node_execution(&NodeExecution {
                run_id: state.run_id,
                node_id: scoped_id.to_string(),
                attempt,
                status,
                output_ref: output,
                error: state.ctx.errors.get(scoped_id).cloned(),
                started_at: now,
                finished_at: status.is_final().then_some(now),
                idem_key,
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Driver state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ReadyItem {
    node_id: String,
    from: Option<String>,
}

struct DriveState {
    run_id: Uuid,
    ctx: RunContext,
    node_state: HashMap<String, NodeStatus>,
    /// Highest attempt number issued per scoped node id.
    attempts: HashMap<String, u32>,
    loop_iterations: HashMap<String, u64>,
    handled_errors: HashSet<String>,
    ready: VecDeque<ReadyItem>,
    /// Shard scope suffix (e.g. `:2`), empty for the run root.
    scope: Option<String>,
    /// Output of the most recently completed node (shard result).
    last_output: Option<Value>,
    /// Set when the loop stopped early (cancelled / timeout).
    cut_short: Option<&'static str>,
}

impl DriveState {
    fn new(run_id: Uuid, ctx: RunContext) -> Self {
        Self {
            run_id,
            ctx,
            node_state: HashMap::new(),
            attempts: HashMap::new(),
            loop_iterations: HashMap::new(),
            handled_errors: HashSet::new(),
            ready: VecDeque::new(),
            scope: None,
            last_output: None,
            cut_short: None,
        }
    }

    fn mark(&mut self, scoped_id: &str, status: NodeStatus) {
        self.node_state.insert(scoped_id.to_string(), status);
        if status == NodeStatus::Done {
            self.last_output = self.ctx.node_outputs.get(scoped_id).cloned();
        }
    }

    fn next_attempt(&mut self, scoped_id: &str) -> u32 {
        let next = self.attempts.get(scoped_id).copied().unwrap_or(0) + 1;
        self.attempts.insert(scoped_id.to_string(), next);
        next
    }

    /// Node errors not routed through a `when=error` edge.
    fn unhandled_errors(&self) -> Vec<(&String, &String)> {
        self.ctx
            .errors
            .iter()
            .filter(|(node_id, _)| !self.handled_errors.contains(*node_id))
            .collect()
    }
}

struct ShardOutcome {
    result: Option<Value>,
    error: Option<String>,
}

/// Strip a shard scope suffix (`fetch:0:1` -> `fetch`).
fn base_node_id(scoped_id: &str) -> &str {
    match scoped_id.find(':') {
        Some(pos) => &scoped_id[..pos],
        None => scoped_id,
    }
}

/// Apply the scope of an existing scoped id to a sibling node id.
fn scoped_sibling(scoped_id: &str, sibling: &str) -> String {
    match scoped_id.find(':') {
        Some(pos) => format!("{sibling}{}", &scoped_id[pos..]),
        None => sibling.to_string(),
    }
}

fn extract_output_vars(ctx: &mut RunContext, action: &crate::dag::ActionData, result: &Value) {
    if let Some(output_vars) = &action.output_vars {
        for (var, path) in output_vars {
            if let Some(value) = extract_path(result, path) {
                ctx.vars.insert(var.clone(), value.clone());
            }
        }
    }
}

fn eval_failure(expr: &str, err: &EvalError) -> String {
    format!("expression '{expr}' failed: {err}")
}
