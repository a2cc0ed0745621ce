//! Operator CLI: validate and compile workflow documents, manage schedules.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use weave::catalog::{ActionSpec, InMemoryCatalog, Provider, TriggerSpec};
use weave::run_state::{CatchupPolicy, OverlapPolicy};
use weave::scheduler::{
    LaunchError, LaunchRequest, RunLauncher, SchedulerService, SingleInstanceLock,
    UpsertScheduleInput,
};
use weave::store::ScheduleStore;
use weave::store_postgres::PostgresStore;
use weave::validator::{self, LintContext, LintOptions, Stage, ValidateOptions};
use weave::Config;

#[derive(Parser)]
#[command(name = "weavectl", about = "Workflow control plane operator tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow document; prints a JSON report.
    Validate {
        /// Document stage: template, executable, or dag
        stage: Stage,
        /// Path to the JSON document
        path: PathBuf,
        /// Optional catalog snapshot (JSON)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Compile an executable document to a DAG.
    Compile {
        /// Path to the executable JSON document
        path: PathBuf,
        /// Write the DAG here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Manage schedules (requires WEAVE_DATABASE_URL).
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    Upsert {
        #[arg(long)]
        workflow_id: String,
        #[arg(long)]
        version: u32,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        cron: String,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long)]
        jitter_ms: Option<u64>,
        #[arg(long)]
        overlap: Option<OverlapPolicy>,
        #[arg(long)]
        catchup: Option<CatchupPolicy>,
        /// Update an existing schedule instead of creating one
        #[arg(long)]
        schedule_id: Option<Uuid>,
    },
    Pause {
        schedule_id: Uuid,
    },
    Resume {
        schedule_id: Uuid,
    },
    Delete {
        schedule_id: Uuid,
    },
    /// Show a schedule and its next five fire times.
    Preview {
        schedule_id: Uuid,
    },
}

/// Schedule CRUD does not launch anything.
struct NoLauncher;

#[async_trait::async_trait]
impl RunLauncher for NoLauncher {
    async fn launch(&self, _request: LaunchRequest) -> std::result::Result<Uuid, LaunchError> {
        Err(LaunchError("launching is not available from weavectl".into()))
    }
}

/// On-disk catalog snapshot format.
#[derive(Deserialize, Default)]
struct CatalogFile {
    #[serde(default)]
    providers: Vec<Provider>,
    #[serde(default)]
    actions: Vec<CatalogAction>,
    #[serde(default)]
    triggers: Vec<CatalogTrigger>,
}

#[derive(Deserialize)]
struct CatalogAction {
    provider: String,
    name: String,
    #[serde(flatten)]
    spec: ActionSpec,
}

#[derive(Deserialize)]
struct CatalogTrigger {
    provider: String,
    slug: String,
    #[serde(flatten)]
    spec: TriggerSpec,
}

fn load_catalog(path: Option<&PathBuf>) -> Result<InMemoryCatalog> {
    let mut catalog = InMemoryCatalog::new();
    let Some(path) = path else {
        return Ok(catalog);
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    let file: CatalogFile = serde_json::from_str(&raw).context("invalid catalog file")?;
    for provider in file.providers {
        catalog.add_provider(&provider.slug, &provider.name);
    }
    for action in file.actions {
        catalog.add_action(&action.provider, &action.name, action.spec);
    }
    for trigger in file.triggers {
        catalog.add_trigger(&trigger.provider, &trigger.slug, trigger.spec);
    }
    Ok(catalog)
}

fn read_doc(path: &PathBuf) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    weave::observability::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Validate {
            stage,
            path,
            catalog,
        } => {
            let doc = read_doc(&path)?;
            let catalog = load_catalog(catalog.as_ref())?;
            let ctx = LintContext {
                catalog: &catalog,
                connections: None,
            };
            let response = validator::validate(stage, &doc, &ctx, ValidateOptions::default());
            let report = validator::lint(stage, &doc, &ctx, LintOptions::default());
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "ok": response.ok,
                    "stage": stage,
                    "errors": response.errors,
                    "warnings": report.warnings,
                    "hints": report.hints,
                }))?
            );
            Ok(if response.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }

        Command::Compile {
            path,
            output,
            catalog,
        } => {
            let doc = read_doc(&path)?;
            let catalog = load_catalog(catalog.as_ref())?;
            let ctx = LintContext {
                catalog: &catalog,
                connections: None,
            };
            let outcome = validator::validate_and_compile(&doc, &ctx);
            if !outcome.ok {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "ok": false,
                        "errors": outcome.errors,
                        "repairs": outcome.repairs,
                    }))?
                );
                return Ok(ExitCode::from(2));
            }
            let dag = serde_json::to_string_pretty(&outcome.dag)?;
            match output {
                Some(out) => {
                    std::fs::write(&out, dag)
                        .with_context(|| format!("failed to write {}", out.display()))?;
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&json!({
                            "ok": true,
                            "output": out,
                            "repairs": outcome.repairs,
                            "warnings": outcome.report.warnings,
                        }))?
                    );
                }
                None => println!("{dag}"),
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Schedule { command } => {
            let config = Config::from_env()?;
            let database_url = config
                .database_url
                .clone()
                .context("WEAVE_DATABASE_URL must be set for schedule commands")?;
            let store = PostgresStore::connect(&database_url).await?;
            store.init_schema().await?;
            let store: Arc<dyn ScheduleStore> = Arc::new(store);
            let service = SchedulerService::new(
                store,
                Arc::new(NoLauncher),
                Arc::new(SingleInstanceLock),
                config,
            );

            match command {
                ScheduleCommand::Upsert {
                    workflow_id,
                    version,
                    user_id,
                    cron,
                    timezone,
                    jitter_ms,
                    overlap,
                    catchup,
                    schedule_id,
                } => {
                    let schedule = service
                        .upsert_schedule(UpsertScheduleInput {
                            schedule_id,
                            workflow_id,
                            version,
                            user_id,
                            cron_expr: cron,
                            timezone,
                            start_at: None,
                            end_at: None,
                            jitter_ms,
                            overlap_policy: overlap,
                            catchup_policy: catchup,
                        })
                        .await?;
                    println!("{}", serde_json::to_string_pretty(&schedule)?);
                }
                ScheduleCommand::Pause { schedule_id } => {
                    service.pause_schedule(schedule_id, true).await?;
                    println!("{}", json!({"schedule_id": schedule_id, "paused": true}));
                }
                ScheduleCommand::Resume { schedule_id } => {
                    service.pause_schedule(schedule_id, false).await?;
                    println!("{}", json!({"schedule_id": schedule_id, "paused": false}));
                }
                ScheduleCommand::Delete { schedule_id } => {
                    service.delete_schedule(schedule_id).await?;
                    println!("{}", json!({"schedule_id": schedule_id, "deleted": true}));
                }
                ScheduleCommand::Preview { schedule_id } => {
                    let preview = service.get_schedule(schedule_id).await?;
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&json!({
                            "schedule": preview.schedule,
                            "next_fire_times": preview.next_fire_times,
                        }))?
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
