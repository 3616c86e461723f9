//! Thin CLI front-end over the maestro engine.
//!
//! All decisions live in `maestro-core`; this binary parses arguments,
//! opens the database, dispatches, and maps outcomes to exit codes
//! (0 success, 1 failure).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use maestro_core::orchestrator::Orchestrator;
use maestro_core::runner::{RunEnd, RunOptions};
use maestro_db::config::DbConfig;
use maestro_db::models::ExecutionMode;
use maestro_db::pool;

#[derive(Parser)]
#[command(name = "maestro", about = "Five-phase workflow engine for CLI coding agents")]
struct Cli {
    /// Database URL (overrides MAESTRO_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Suppress info-level output
    #[arg(long, global = true)]
    quiet: bool,

    /// Enable debug-level output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the workflow from phase 1
    Start {
        /// Phase to start from (1-5)
        #[arg(long, default_value_t = 1)]
        phase: i32,
        /// Stop after this phase (1-5)
        #[arg(long, default_value_t = 5)]
        end_phase: i32,
        /// Skip the plan validation phase
        #[arg(long)]
        skip_validation: bool,
        /// Disable auto-commit after successful phases
        #[arg(long)]
        no_commit: bool,
        /// Override maxPhaseRetries for this run
        #[arg(long)]
        max_retries: Option<u32>,
        /// Pause for human input on escalation instead of aborting
        #[arg(long)]
        hitl: bool,
    },
    /// Resume from the first non-completed phase
    Resume {
        /// Pause for human input on escalation instead of aborting
        #[arg(long)]
        hitl: bool,
    },
    /// Show workflow status
    Status,
    /// Check agent availability and workflow health
    Health,
    /// Destroy workflow state and tasks
    Reset {
        /// Skip the confirmation check
        #[arg(long)]
        force: bool,
    },
    /// Roll back source and state to before a phase
    Rollback {
        /// Phase to roll back to (1-5)
        phase: i32,
    },
    /// Checkpoint management
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Create a checkpoint of the current workflow state
    Create {
        /// Checkpoint name
        name: String,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// List checkpoints
    List,
    /// Delete a checkpoint
    Delete {
        /// Checkpoint id (12 hex chars)
        id: String,
    },
    /// Restore a checkpoint (state + git reset)
    Restore {
        /// Checkpoint id (12 hex chars)
        id: String,
        /// Required: rollback discards current state
        #[arg(long)]
        confirm: bool,
    },
}

fn init_tracing(quiet: bool, debug: bool) {
    let default_level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_orchestrator(cli: &Cli) -> Result<Orchestrator> {
    let config = match &cli.database_url {
        Some(url) => DbConfig::new(url.clone()),
        None => DbConfig::from_env(),
    };
    pool::ensure_database_exists(&config)
        .await
        .context("failed to ensure database exists")?;
    let pool = pool::create_pool(&config).await?;
    pool::run_migrations(&pool, pool::default_migrations_path()).await?;

    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or(std::env::current_dir().context("cannot determine current directory")?);
    Orchestrator::new(pool, project_dir)
}

fn execution_mode(hitl: bool) -> ExecutionMode {
    if hitl { ExecutionMode::Hitl } else { ExecutionMode::Afk }
}

/// Pause the workflow at the next phase boundary on Ctrl-C.
fn cancel_on_ctrl_c(orchestrator: &Orchestrator) {
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; pausing at the next phase boundary");
            cancel.cancel();
        }
    });
}

async fn run(cli: Cli) -> Result<bool> {
    match &cli.command {
        Commands::Start {
            phase,
            end_phase,
            skip_validation,
            no_commit,
            max_retries,
            hitl,
        } => {
            let mut orchestrator = open_orchestrator(&cli).await?;
            if let Some(max) = max_retries {
                // Per-run override, not persisted to the config file.
                orchestrator.config_mut().validation.max_phase_retries = *max;
            }
            cancel_on_ctrl_c(&orchestrator);
            let report = orchestrator
                .run(
                    RunOptions {
                        start_phase: *phase,
                        end_phase: *end_phase,
                        skip_validation: *skip_validation,
                        auto_commit: !*no_commit,
                    },
                    execution_mode(*hitl),
                )
                .await?;
            report_run(&report.end);
            Ok(matches!(report.end, RunEnd::Succeeded))
        }

        Commands::Resume { hitl } => {
            let orchestrator = open_orchestrator(&cli).await?;
            cancel_on_ctrl_c(&orchestrator);
            let report = orchestrator.resume(execution_mode(*hitl)).await?;
            report_run(&report.end);
            Ok(matches!(report.end, RunEnd::Succeeded))
        }

        Commands::Status => {
            let orchestrator = open_orchestrator(&cli).await?;
            match orchestrator.status().await? {
                Some(status) => {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                    Ok(true)
                }
                None => {
                    println!("no workflow state; run `maestro start` first");
                    Ok(true)
                }
            }
        }

        Commands::Health => {
            let orchestrator = open_orchestrator(&cli).await?;
            let health = orchestrator.health_check().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(health.status != "unhealthy")
        }

        Commands::Reset { force } => {
            if !force {
                anyhow::bail!("reset destroys all workflow state; pass --force to confirm");
            }
            let orchestrator = open_orchestrator(&cli).await?;
            orchestrator.reset().await?;
            println!("workflow state reset");
            Ok(true)
        }

        Commands::Rollback { phase } => {
            let orchestrator = open_orchestrator(&cli).await?;
            orchestrator.rollback_to_phase(*phase).await?;
            println!("rolled back to before phase {phase}");
            Ok(true)
        }

        Commands::Checkpoint { command } => {
            let orchestrator = open_orchestrator(&cli).await?;
            let manager = orchestrator.checkpoints();
            match command {
                CheckpointCommands::Create { name, notes } => {
                    let checkpoint = manager.create(name, notes.as_deref(), None).await?;
                    println!("created checkpoint {} ({})", checkpoint.id, checkpoint.name);
                }
                CheckpointCommands::List => {
                    for checkpoint in manager.list(100).await? {
                        println!(
                            "{}  phase {}  {}  {}",
                            checkpoint.id, checkpoint.phase, checkpoint.created_at, checkpoint.name
                        );
                    }
                }
                CheckpointCommands::Delete { id } => {
                    if manager.delete(id).await? {
                        println!("deleted checkpoint {id}");
                    } else {
                        anyhow::bail!("checkpoint {id} not found");
                    }
                }
                CheckpointCommands::Restore { id, confirm } => {
                    let report = manager.rollback(id, *confirm).await?;
                    println!(
                        "restored checkpoint {} (phase {}, git {})",
                        report.checkpoint_id,
                        report.restored_phase,
                        report.git_hash.as_deref().unwrap_or("unchanged")
                    );
                }
            }
            Ok(true)
        }
    }
}

fn report_run(end: &RunEnd) {
    match end {
        RunEnd::Succeeded => println!("workflow succeeded"),
        RunEnd::Paused { at_phase } => {
            println!("workflow paused at phase {at_phase}; see .workflow/handoff_brief.md")
        }
        RunEnd::Aborted { at_phase } => {
            println!("workflow aborted at phase {at_phase}; see .workflow/handoff_brief.md")
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.debug);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
