//! `steroids` — thin CLI over `steroids-core` and `steroids-state`.

use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use steroids_core::SteroidsErr;
use steroids_core::config::Config;
use steroids_core::config::load_config;
use steroids_core::config::project_config_path;
use steroids_core::orchestrator::LoopOutcome;
use steroids_core::orchestrator::Orchestrator;
use steroids_core::orchestrator::OrchestratorOptions;
use steroids_core::recovery::RecoveryEngine;
use steroids_core::recovery::Sanitizer;
use steroids_core::recovery::SystemProcessProbe;
use steroids_state::AuditParams;
use steroids_state::GlobalStore;
use steroids_state::MigrationError;
use steroids_state::OpenOptions;
use steroids_state::ProjectStore;
use steroids_state::ReleaseOutcome;
use steroids_state::SteroidsHome;
use steroids_state::SteroidsPaths;
use steroids_state::TaskStatus;

/// Automated task-execution orchestrator.
#[derive(Debug, Parser)]
#[clap(name = "steroids", bin_name = "steroids", version)]
struct MultitoolCli {
    /// Emit machine-readable JSON instead of human text.
    #[clap(long, global = true)]
    json: bool,

    /// Project directory (defaults to the current directory).
    #[clap(long, global = true, value_name = "DIR")]
    project: Option<PathBuf>,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Run the orchestrator loop against the project until no work remains.
    Run(RunArgs),

    /// Apply (or roll back) schema migrations.
    Migrate(MigrateArgs),

    /// Inspect and manage task leases.
    #[clap(subcommand)]
    Locks(LocksCommand),

    /// One stuck-task detection pass, with recovery unless --dry-run.
    Recover(RecoverArgs),

    /// Task counts, live leases, registered runners, and open incidents.
    Status,

    /// Operator actions on a single task.
    #[clap(subcommand)]
    Task(TaskCommand),

    /// Read or write dotted configuration values in the project config.
    #[clap(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Restrict selection to these sections, in priority order.
    #[clap(long, value_delimiter = ',', value_name = "SECTION")]
    sections: Vec<String>,

    /// Process at most one task, then exit.
    #[clap(long)]
    once: bool,

    /// Mirror provider output to this terminal.
    #[clap(long)]
    stream: bool,
}

#[derive(Debug, clap::Args)]
struct MigrateArgs {
    /// Roll back to this migration id instead of migrating up.
    #[clap(long, value_name = "ID")]
    down: Option<i64>,

    /// Print the schema version without changing anything.
    #[clap(long)]
    status: bool,
}

#[derive(Debug, clap::Subcommand)]
enum LocksCommand {
    /// List live task leases.
    List,
    /// Release one task lease.
    Release {
        task_id: String,
        /// Runner id asserting ownership; required without --force.
        #[clap(long)]
        runner: Option<String>,
        /// Delete the lease regardless of owner.
        #[clap(long)]
        force: bool,
    },
}

#[derive(Debug, clap::Args)]
struct RecoverArgs {
    /// Report detections without applying recovery actions.
    #[clap(long)]
    dry_run: bool,
}

#[derive(Debug, clap::Subcommand)]
enum TaskCommand {
    /// Mark a task failed (operator-only transition).
    Fail {
        task_id: String,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Park a task as skipped.
    Skip { task_id: String },
}

#[derive(Debug, clap::Subcommand)]
enum ConfigCommand {
    Get { path: String },
    Set { path: String, value: String },
}

struct CommandOutput {
    json: serde_json::Value,
    text: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = MultitoolCli::parse();
    let json = cli.json;
    match dispatch(cli).await {
        Ok(output) => {
            if json {
                println!("{}", output.json);
            } else if !output.text.is_empty() {
                println!("{}", output.text);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            if json {
                println!(
                    "{}",
                    json!({
                        "success": false,
                        "error": {
                            "code": err.code(),
                            "message": err.to_string(),
                            "details": err.details(),
                        },
                    })
                );
            } else {
                eprintln!("steroids: {err}");
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn dispatch(cli: MultitoolCli) -> Result<CommandOutput, SteroidsErr> {
    let project_root = match cli.project {
        Some(project) => project,
        None => std::env::current_dir().map_err(anyhow::Error::from)?,
    };
    let home = SteroidsHome::resolve()?;
    let config = load_config(&project_root, &home).await?;

    match cli.subcommand {
        Subcommand::Run(args) => run(project_root, home, config, args).await,
        Subcommand::Migrate(args) => migrate(&project_root, &config, args).await,
        Subcommand::Locks(command) => locks(&project_root, &config, command).await,
        Subcommand::Recover(args) => recover(project_root, home, config, args).await,
        Subcommand::Status => status(project_root, home, config).await,
        Subcommand::Task(command) => task(&project_root, &config, command).await,
        Subcommand::Config(command) => config_command(&project_root, command).await,
    }
}

fn open_options(config: &Config) -> OpenOptions {
    OpenOptions {
        auto_migrate: config.database.auto_migrate,
        backup_before_migrate: config.database.backup_before_migrate,
    }
}

async fn open_project(
    project_root: &std::path::Path,
    config: &Config,
) -> Result<ProjectStore, SteroidsErr> {
    ProjectStore::open(project_root, &open_options(config))
        .await
        .map_err(into_steroids_err)
}

async fn open_global(home: &SteroidsHome, config: &Config) -> Result<GlobalStore, SteroidsErr> {
    GlobalStore::open(home.clone(), &open_options(config))
        .await
        .map_err(into_steroids_err)
}

/// Migration failures at open keep their identity (`checksum_mismatch`,
/// `schema_ahead`) instead of collapsing into the general bucket.
fn into_steroids_err(err: anyhow::Error) -> SteroidsErr {
    match err.downcast::<MigrationError>() {
        Ok(migration_err) => migration_err.into(),
        Err(err) => SteroidsErr::Other(err),
    }
}

async fn run(
    project_root: PathBuf,
    home: SteroidsHome,
    config: Config,
    args: RunArgs,
) -> Result<CommandOutput, SteroidsErr> {
    let paths = SteroidsPaths::for_project(&project_root);
    let _log_guard = init_tracing(&paths);

    let store = open_project(&project_root, &config).await?;
    let global = open_global(&home, &config).await?;
    let orchestrator = Orchestrator::new(
        project_root,
        store,
        global,
        home,
        config,
        OrchestratorOptions {
            section_scope: args.sections,
            once: args.once,
            stream_output: args.stream,
            ..Default::default()
        },
        None,
    );

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        match sigterm {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        tracing::info!("stop requested; draining current iteration");
        cancel.cancel();
    });

    let summary = orchestrator.run().await?;
    let outcome = match summary.outcome {
        LoopOutcome::Idle => "idle",
        LoopOutcome::Cancelled => "cancelled",
    };
    Ok(CommandOutput {
        json: json!({
            "success": true,
            "outcome": outcome,
            "tasksProcessed": summary.tasks_processed,
        }),
        text: format!(
            "{outcome}: processed {} task pass(es)",
            summary.tasks_processed
        ),
    })
}

async fn migrate(
    project_root: &std::path::Path,
    config: &Config,
    args: MigrateArgs,
) -> Result<CommandOutput, SteroidsErr> {
    // Open without auto-migration so --status and --down see the store
    // as-is; bringing the schema forward is this command's explicit job.
    let store = ProjectStore::open(
        project_root,
        &OpenOptions {
            auto_migrate: false,
            backup_before_migrate: config.database.backup_before_migrate,
        },
    )
    .await
    .map_err(into_steroids_err)?;

    if args.status {
        let version = store.schema_version().await?;
        return Ok(CommandOutput {
            json: json!({ "success": true, "schemaVersion": version }),
            text: format!("schema version {version}"),
        });
    }
    if let Some(target) = args.down {
        let reverted = store.migrate_down(target).await?;
        return Ok(CommandOutput {
            json: json!({ "success": true, "reverted": reverted, "target": target }),
            text: format!("reverted {reverted} migration(s) to version {target}"),
        });
    }
    let applied = store.migrate_up().await?;
    let version = store.schema_version().await?;
    Ok(CommandOutput {
        json: json!({ "success": true, "applied": applied, "schemaVersion": version }),
        text: format!("applied {applied} migration(s); schema version {version}"),
    })
}

async fn locks(
    project_root: &std::path::Path,
    config: &Config,
    command: LocksCommand,
) -> Result<CommandOutput, SteroidsErr> {
    let store = open_project(project_root, config).await?;
    match command {
        LocksCommand::List => {
            let locks = store.list_task_locks().await?;
            let rows: Vec<serde_json::Value> = locks
                .iter()
                .map(|lock| {
                    json!({
                        "taskId": lock.task_id,
                        "runnerId": lock.runner_id,
                        "acquiredAt": lock.acquired_at.to_rfc3339(),
                        "expiresAt": lock.expires_at.to_rfc3339(),
                    })
                })
                .collect();
            let text = if locks.is_empty() {
                "no live task leases".to_string()
            } else {
                locks
                    .iter()
                    .map(|lock| {
                        format!(
                            "{}\theld by {}\texpires {}",
                            lock.task_id,
                            lock.runner_id,
                            lock.expires_at.to_rfc3339()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            Ok(CommandOutput {
                json: json!({ "success": true, "locks": rows }),
                text,
            })
        }
        LocksCommand::Release {
            task_id,
            runner,
            force,
        } => {
            if force {
                let released = store.force_release_task_lock(&task_id).await?;
                if !released {
                    return Err(SteroidsErr::LockNotFound { id: task_id });
                }
                return Ok(CommandOutput {
                    json: json!({ "success": true, "taskId": task_id, "forced": true }),
                    text: format!("force-released lease on {task_id}"),
                });
            }
            let Some(runner) = runner else {
                return Err(SteroidsErr::Other(anyhow::anyhow!(
                    "--runner is required unless --force is given"
                )));
            };
            match store.release_task_lock(&task_id, &runner).await? {
                ReleaseOutcome::Released => Ok(CommandOutput {
                    json: json!({ "success": true, "taskId": task_id, "forced": false }),
                    text: format!("released lease on {task_id}"),
                }),
                ReleaseOutcome::NotFound => Err(SteroidsErr::LockNotFound { id: task_id }),
                ReleaseOutcome::NotOwner { holder } => Err(SteroidsErr::PermissionDenied {
                    id: task_id,
                    holder,
                }),
            }
        }
    }
}

async fn recover(
    project_root: PathBuf,
    home: SteroidsHome,
    config: Config,
    args: RecoverArgs,
) -> Result<CommandOutput, SteroidsErr> {
    let store = open_project(&project_root, &config).await?;
    let global = open_global(&home, &config).await?;
    let engine = RecoveryEngine::new(
        store.clone(),
        global,
        config.health.clone(),
        std::sync::Arc::new(SystemProcessProbe),
        project_root.display().to_string(),
    );
    let report = engine.run(!args.dry_run).await?;
    let sanitize_report = if args.dry_run {
        None
    } else {
        Some(Sanitizer::new(store, config.health.clone()).run(true).await?)
    };

    let detections: Vec<serde_json::Value> = report
        .detections
        .iter()
        .map(|detection| {
            json!({
                "failureMode": detection.failure_mode.as_str(),
                "taskId": detection.task_id,
                "runnerId": detection.runner_id,
                "reason": detection.reason,
            })
        })
        .collect();
    let actions: Vec<serde_json::Value> = report
        .actions
        .iter()
        .map(|action| {
            json!({
                "failureMode": action.failure_mode.as_str(),
                "taskId": action.task_id,
                "runnerId": action.runner_id,
                "resolution": action.resolution.as_str(),
            })
        })
        .collect();
    let text = format!(
        "{} detection(s), {} action(s){}{}",
        report.detections.len(),
        report.actions.len(),
        if report.rate_limited {
            " (rate limited)"
        } else {
            ""
        },
        sanitize_report
            .as_ref()
            .map(|report| {
                format!(
                    "; sanitizer closed {} invocation(s), swept {} lease(s)",
                    report.closed_invocations,
                    report.expired_task_locks + report.expired_section_locks
                )
            })
            .unwrap_or_default(),
    );
    Ok(CommandOutput {
        json: json!({
            "success": true,
            "rateLimited": report.rate_limited,
            "detections": detections,
            "actions": actions,
        }),
        text,
    })
}

async fn status(
    project_root: PathBuf,
    home: SteroidsHome,
    config: Config,
) -> Result<CommandOutput, SteroidsErr> {
    let store = open_project(&project_root, &config).await?;
    let global = open_global(&home, &config).await?;
    let counts = store.task_counts().await?;
    let locks = store.list_task_locks().await?;
    let runners = global
        .list_runners_for_project(&project_root.display().to_string())
        .await?;
    let incidents = store.list_open_incidents().await?;

    let text = format!(
        "tasks: {} pending, {} in progress, {} review, {} completed, {} disputed, {} failed, {} skipped\n\
         leases: {} live; runners: {}; open incidents: {}",
        counts.pending,
        counts.in_progress,
        counts.review,
        counts.completed,
        counts.disputed,
        counts.failed,
        counts.skipped,
        locks.len(),
        runners.len(),
        incidents.len(),
    );
    Ok(CommandOutput {
        json: json!({
            "success": true,
            "tasks": {
                "pending": counts.pending,
                "inProgress": counts.in_progress,
                "review": counts.review,
                "completed": counts.completed,
                "disputed": counts.disputed,
                "failed": counts.failed,
                "skipped": counts.skipped,
            },
            "locks": locks.len(),
            "runners": runners.len(),
            "openIncidents": incidents.len(),
        }),
        text,
    })
}

async fn task(
    project_root: &std::path::Path,
    config: &Config,
    command: TaskCommand,
) -> Result<CommandOutput, SteroidsErr> {
    let store = open_project(project_root, config).await?;
    let (task_id, to, notes) = match command {
        TaskCommand::Fail { task_id, reason } => (
            task_id,
            TaskStatus::Failed,
            reason.unwrap_or_else(|| "failed by operator".to_string()),
        ),
        TaskCommand::Skip { task_id } => {
            (task_id, TaskStatus::Skipped, "skipped by operator".to_string())
        }
    };
    let transitioned = store
        .transition_task(
            &task_id,
            to,
            &AuditParams::human("operator").with_notes(notes),
        )
        .await?;
    if !transitioned {
        return Err(SteroidsErr::Other(anyhow::anyhow!(
            "task {task_id} not found or already {}",
            to.as_str()
        )));
    }
    Ok(CommandOutput {
        json: json!({ "success": true, "taskId": task_id, "status": to.as_str() }),
        text: format!("task {task_id} is now {}", to.as_str()),
    })
}

async fn config_command(
    project_root: &std::path::Path,
    command: ConfigCommand,
) -> Result<CommandOutput, SteroidsErr> {
    let path = project_config_path(project_root);
    match command {
        ConfigCommand::Get { path: dotted } => {
            let value = steroids_core::config::get_config_file_value(&path, &dotted).await?;
            let text = match &value {
                Some(value) => serde_yaml::to_string(value)
                    .map_err(anyhow::Error::from)?
                    .trim_end()
                    .to_string(),
                None => format!("{dotted} is not set"),
            };
            Ok(CommandOutput {
                json: json!({ "success": true, "path": dotted, "value": value }),
                text,
            })
        }
        ConfigCommand::Set { path: dotted, value } => {
            let parsed: serde_yaml::Value =
                serde_yaml::from_str(&value).map_err(anyhow::Error::from)?;
            steroids_core::config::set_config_file_value(&path, &dotted, parsed).await?;
            Ok(CommandOutput {
                json: json!({ "success": true, "path": dotted }),
                text: format!("set {dotted}"),
            })
        }
    }
}

/// Stderr plus a daily file under `.steroids/logs/YYYY-MM-DD/`.
fn init_tracing(paths: &SteroidsPaths) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let dir = paths.logs_dir_for_day(&day);
    let file_layer = match std::fs::create_dir_all(&dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(dir, "runner.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Some((
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
                guard,
            ))
        }
        Err(_) => None,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match file_layer {
        Some((file_layer, guard)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
