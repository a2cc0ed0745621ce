//! Weave - workflow control plane
//!
//! This crate turns declarative workflow documents into reliable,
//! observable runs. The three cooperating components are:
//!
//! ## Validator / Compiler
//!
//! - [`validator`]: stage-aware validation (`template` / `executable` /
//!   `dag`), a lint rule registry with deterministic auto-repair, and the
//!   lowering from executable documents to [`Dag`] graphs
//! - [`lexer`] / [`parser`] / [`ast_evaluator`]: the bounded guard-expression
//!   sublanguage used by gateways, loops, and edge conditions
//!
//! ## Scheduler
//!
//! - [`schedule`]: IANA-timezone and DST-aware cron math
//! - [`scheduler`]: the single-leader tick worker with catchup, overlap,
//!   and jitter policies
//!
//! ## Executor
//!
//! - [`executor`]: per-run dispatch loop with gateways, joins, loops,
//!   bounded foreach fan-out, retries, and idempotent action invocation
//! - [`store`] / [`store_postgres`]: injectable persistence (in-memory and
//!   Postgres)

pub mod ast_evaluator;
pub mod catalog;
pub mod config;
pub mod dag;
pub mod executor;
pub mod idempotency;
pub mod invoker;
pub mod lexer;
pub mod observability;
pub mod parser;
pub mod retry;
pub mod run_state;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod store_postgres;
pub mod template;
pub mod test_support;
pub mod triggers;
pub mod validator;

// Configuration
pub use config::Config;

// DAG model
pub use dag::{Dag, DagIndex, Edge, EdgeWhen, JoinMode, Node, NodeData, TriggerKind};

// Expression engine
pub use ast_evaluator::{eval_bool, eval_str, EvalError, Scope};
pub use parser::{parse, Expr, ParseError};

// Validator / compiler
pub use validator::{
    attempt_repair, compile_executable, compile_value, lint, validate, validate_and_compile,
    CompileOutcome, LintContext, LintReport, Severity, Stage, ValidationError,
};

// Catalog and invoker seams
pub use catalog::{ActionSpec, Connections, InMemoryCatalog, ToolCatalog, TriggerSpec};
pub use invoker::{HttpToolInvoker, InvokeError, InvokeErrorKind, InvokeRequest, ToolInvoker};

// Stores
pub use store::{
    MemoryRunStore, MemoryScheduleStore, MemoryWorkflowStore, RunStore, ScheduleStore, StoreError,
    WorkflowStore,
};
pub use store_postgres::PostgresStore;

// Executor
pub use executor::{ExecError, Executor, ExecutorConfig};
pub use idempotency::{action_idem_key, IdempotencyCache};
pub use retry::{BackoffKind, RetryPolicy};
pub use run_state::{
    CatchupPolicy, NodeStatus, OverlapPolicy, RunSource, RunStatus, Schedule, ScheduleRunStatus,
    WorkflowRun,
};
pub use triggers::{EventDelivery, TriggerIndex};

// Scheduler
pub use schedule::{
    enumerate_due_times, next_fire_after, preview_fire_times, schedule_idempotency_key,
    validate_cron,
};
pub use scheduler::{
    ExecutorLauncher, LaunchError, LaunchRequest, LeaderLock, RunLauncher, SchedulePreview,
    SchedulerService, SchedulerWorker, SingleInstanceLock, UpsertScheduleInput,
};
