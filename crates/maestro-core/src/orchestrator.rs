//! Top-level driver: prerequisites, resume, rollback, and the retrying
//! phase loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

use maestro_db::models::{ExecutionMode, NextDecision, StepStatus};
use maestro_db::queries::{tasks, workflow};

use crate::actionlog::{ActionEntry, ActionLog, ActionType};
use crate::agents::{AgentCli, ClaudeCli, CursorCli, GeminiCli};
use crate::budget::BudgetEnforcer;
use crate::checkpoint::CheckpointManager;
use crate::config::ProjectConfig;
use crate::drift;
use crate::gitops::GitOps;
use crate::invoker::AgentInvoker;
use crate::phases::{Phase, PhaseContext, decode_phase_map};
use crate::runner::{PhaseRunner, RunOptions, RunReport};
use crate::session::SessionManager;
use crate::spec;

/// Health report for the `health` surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub status: String,
    pub agents: std::collections::BTreeMap<String, bool>,
    pub current_phase: Option<i32>,
    pub current_phase_status: Option<StepStatus>,
}

/// Summary for the `status` surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub project_dir: String,
    pub current_phase: i32,
    pub next_decision: NextDecision,
    pub iteration_count: i32,
    pub phase_statuses: std::collections::BTreeMap<i32, StepStatus>,
    pub tasks_completed: i64,
    pub tasks_total: i64,
    pub total_commits: usize,
}

/// The engine's front door. The CLI and dashboards call nothing below
/// this type.
pub struct Orchestrator {
    ctx: PhaseContext,
    checkpoints: CheckpointManager,
    cancel: tokio_util::sync::CancellationToken,
}

impl Orchestrator {
    /// Wire up an orchestrator with the default agent adapters.
    pub fn new(pool: PgPool, project_dir: PathBuf) -> Result<Self> {
        let claude: Arc<dyn AgentCli> = Arc::new(ClaudeCli::new());
        let cursor: Arc<dyn AgentCli> = Arc::new(CursorCli::new());
        let gemini: Arc<dyn AgentCli> = Arc::new(GeminiCli::new());
        Self::with_agents(pool, project_dir, claude, cursor, gemini)
    }

    /// Wire up with explicit agent adapters (tests inject fakes here).
    pub fn with_agents(
        pool: PgPool,
        project_dir: PathBuf,
        claude: Arc<dyn AgentCli>,
        cursor: Arc<dyn AgentCli>,
        gemini: Arc<dyn AgentCli>,
    ) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .unwrap_or(project_dir);
        let workflow_dir = project_dir.join(".workflow");
        let config = ProjectConfig::load(&project_dir);
        let log = ActionLog::open(&workflow_dir)?;

        let enforcer = BudgetEnforcer::new(pool.clone(), config.budget.clone());
        let sessions = SessionManager::new(pool.clone());
        let invoker = AgentInvoker::new(
            pool.clone(),
            enforcer.clone(),
            sessions.clone(),
            project_dir.clone(),
        );
        let git = GitOps::new(&project_dir);

        let project_name = project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let checkpoints = CheckpointManager::new(pool.clone(), git.clone(), project_name);

        let ctx = PhaseContext {
            pool,
            config,
            project_dir,
            workflow_dir,
            invoker,
            enforcer,
            sessions,
            git,
            log,
            claude,
            cursor,
            gemini,
        };

        Ok(Self {
            ctx,
            checkpoints,
            cancel: tokio_util::sync::CancellationToken::new(),
        })
    }

    /// Token callers can cancel (e.g. on SIGINT) to pause the workflow at
    /// the next phase boundary.
    pub fn cancel_token(&self) -> tokio_util::sync::CancellationToken {
        self.cancel.clone()
    }

    pub fn context(&self) -> &PhaseContext {
        &self.ctx
    }

    /// Mutable access to the loaded configuration, for per-run CLI
    /// overrides (never persisted).
    pub fn config_mut(&mut self) -> &mut ProjectConfig {
        &mut self.ctx.config
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Check preconditions that must hold before any agent call: a usable
    /// product spec and all three agent CLIs on PATH.
    pub async fn check_prerequisites(&self) -> (bool, Vec<String>) {
        let mut errors = Vec::new();

        if spec::find_product_spec(&self.ctx.project_dir).is_none()
            && !self.ctx.config.documentation_discovery_enabled()
        {
            errors.push(
                "PRODUCT.md not found. Create it with your feature specification.".to_string(),
            );
        }

        for cli in [&self.ctx.claude, &self.ctx.cursor, &self.ctx.gemini] {
            if !cli.check_available().await {
                errors.push(format!(
                    "{} CLI not found ({} is not runnable)",
                    cli.name(),
                    cli.binary()
                ));
            }
        }

        (errors.is_empty(), errors)
    }

    /// Ensure the workflow state row exists, creating it on first run and
    /// capturing the initial context snapshot.
    pub async fn ensure_state(
        &self,
        execution_mode: ExecutionMode,
        end_phase: i32,
    ) -> Result<()> {
        if workflow::get_state(&self.ctx.pool).await?.is_none() {
            workflow::create_state(
                &self.ctx.pool,
                &self.ctx.project_dir.to_string_lossy(),
                execution_mode,
                end_phase,
            )
            .await?;
            self.sync_context().await?;
            info!(end_phase, "workflow state created");
        }

        // `.workflow/state.json` is a pointer in DB-backed mode so tools
        // that expect the file layout can find the backend.
        std::fs::create_dir_all(&self.ctx.workflow_dir)?;
        let pointer = serde_json::json!({
            "backend": "database",
            "project_dir": self.ctx.project_dir.to_string_lossy(),
        });
        std::fs::write(
            self.ctx.workflow_dir.join("state.json"),
            serde_json::to_string_pretty(&pointer)?,
        )?;
        Ok(())
    }

    /// Re-capture checksums of the tracked context files (explicit
    /// re-sync after acknowledged drift, and initial capture).
    pub async fn sync_context(&self) -> Result<()> {
        let snapshot = drift::capture(&self.ctx.project_dir);
        workflow::update_context_snapshot(&self.ctx.pool, &serde_json::to_value(&snapshot)?)
            .await?;
        Ok(())
    }

    /// Run the workflow.
    pub async fn run(
        &self,
        options: RunOptions,
        execution_mode: ExecutionMode,
    ) -> Result<RunReport> {
        let (ok, errors) = self.check_prerequisites().await;
        if !ok {
            for error in &errors {
                warn!(error, "prerequisite failed");
            }
            anyhow::bail!("prerequisites not met: {}", errors.join("; "));
        }

        self.ensure_state(execution_mode, options.end_phase).await?;
        self.ctx.log.append(ActionEntry::new(
            ActionType::WorkflowStart,
            format!(
                "workflow started (phases {}..={}, mode {execution_mode})",
                options.start_phase, options.end_phase
            ),
        ));

        // Stale sessions from an earlier run are advisory-expired before
        // new invocations begin.
        if let Err(e) = self.ctx.sessions.cleanup_expired().await {
            warn!(error = %e, "session cleanup failed");
        }

        let runner = PhaseRunner::with_cancel(self.ctx.clone(), self.cancel.clone());
        runner.run(&options).await
    }

    /// Resume: restart from the first non-completed phase.
    pub async fn resume(&self, execution_mode: ExecutionMode) -> Result<RunReport> {
        let state = workflow::get_state(&self.ctx.pool)
            .await?
            .context("nothing to resume: workflow state not initialized")?;

        let map = decode_phase_map(&state.phase_status);
        let start_phase = Phase::ALL
            .iter()
            .find(|p| map.get(&p.number()).map(|e| e.status) != Some(StepStatus::Completed))
            .map(|p| p.number())
            .unwrap_or(5);

        info!(start_phase, "resuming workflow");
        self.ctx.log.append(ActionEntry::new(
            ActionType::WorkflowResume,
            format!("resuming from phase {start_phase}"),
        ));

        self.run(
            RunOptions {
                start_phase,
                end_phase: state.end_phase,
                ..RunOptions::default()
            },
            execution_mode,
        )
        .await
    }

    /// Roll back to the state before `phase`: reset later phase statuses
    /// and hard-reset source to the last commit recorded before that
    /// phase.
    pub async fn rollback_to_phase(&self, phase: i32) -> Result<()> {
        if !(1..=5).contains(&phase) {
            anyhow::bail!("invalid phase {phase}");
        }
        let state = workflow::get_state(&self.ctx.pool)
            .await?
            .context("workflow state not initialized")?;

        // Find the last commit strictly before the target phase.
        let target_commit = state
            .git_commits
            .as_array()
            .and_then(|commits| {
                commits
                    .iter()
                    .rev()
                    .find(|c| c.get("phase").and_then(|p| p.as_i64()).unwrap_or(99) < phase as i64)
            })
            .and_then(|c| c.get("hash").and_then(|h| h.as_str()))
            .map(str::to_string);

        let Some(hash) = target_commit else {
            anyhow::bail!("no commit recorded before phase {phase}; cannot roll back source");
        };

        self.ctx.git.reset_hard(&hash).await?;

        // Reset this phase and everything after it.
        let mut map = decode_phase_map(&state.phase_status);
        for p in Phase::ALL {
            if p.number() >= phase {
                let entry = map.entry(p.number()).or_default();
                entry.status = StepStatus::Pending;
                entry.attempts = 0;
                entry.started_at = None;
                entry.completed_at = None;
                entry.error = None;
            }
        }
        let encoded = serde_json::to_value(
            map.iter()
                .map(|(k, v)| (k.to_string(), serde_json::to_value(v).unwrap_or_default()))
                .collect::<serde_json::Map<_, _>>(),
        )?;
        workflow::update_phase_status(&self.ctx.pool, &encoded).await?;
        workflow::update_phase(&self.ctx.pool, phase.max(1), NextDecision::Continue).await?;

        self.ctx.log.append(
            ActionEntry::new(
                ActionType::GitRollback,
                format!("rolled back to {hash} (before phase {phase})"),
            )
            .phase(phase),
        );
        info!(phase, hash = %hash, "rollback complete");
        Ok(())
    }

    /// Destroy workflow state and tasks (explicit reset only).
    pub async fn reset(&self) -> Result<()> {
        workflow::delete_state(&self.ctx.pool).await?;
        tasks::delete_all_tasks(&self.ctx.pool).await?;
        self.ctx.log.append(ActionEntry::new(
            ActionType::Info,
            "workflow state reset".to_string(),
        ));
        Ok(())
    }

    /// Current workflow status.
    pub async fn status(&self) -> Result<Option<StatusReport>> {
        let Some(state) = workflow::get_state(&self.ctx.pool).await? else {
            return Ok(None);
        };
        let map = decode_phase_map(&state.phase_status);
        let progress = tasks::get_progress(&self.ctx.pool).await?;

        Ok(Some(StatusReport {
            project_dir: state.project_dir,
            current_phase: state.current_phase,
            next_decision: state.next_decision,
            iteration_count: state.iteration_count,
            phase_statuses: map.into_iter().map(|(k, v)| (k, v.status)).collect(),
            tasks_completed: progress.completed,
            tasks_total: progress.total,
            total_commits: state
                .git_commits
                .as_array()
                .map(|c| c.len())
                .unwrap_or(0),
        }))
    }

    /// Agent availability and current phase health.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let mut agent_status = std::collections::BTreeMap::new();
        for cli in [&self.ctx.claude, &self.ctx.cursor, &self.ctx.gemini] {
            agent_status.insert(cli.name().to_string(), cli.check_available().await);
        }
        let all_available = agent_status.values().all(|v| *v);

        let state = workflow::get_state(&self.ctx.pool).await?;
        let (current_phase, current_status) = match &state {
            Some(state) => {
                let map = decode_phase_map(&state.phase_status);
                (
                    Some(state.current_phase),
                    map.get(&state.current_phase).map(|e| e.status),
                )
            }
            None => (None, None),
        };

        let status = if current_status == Some(StepStatus::Failed) {
            "unhealthy"
        } else if !all_available {
            "degraded"
        } else {
            "healthy"
        };

        Ok(HealthReport {
            status: status.to_string(),
            agents: agent_status,
            current_phase,
            current_phase_status: current_status,
        })
    }
}
