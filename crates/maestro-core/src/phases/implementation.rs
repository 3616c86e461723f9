//! Phase 3: Implementation. Contains the task loop; with more than one
//! configured worker, independent ready tasks run as a parallel worktree
//! batch first, then the sequential loop drains the rest.

use std::sync::Arc;

use anyhow::Result;

use maestro_db::queries::{tasks, workflow};

use crate::actionlog::{ActionEntry, ActionStatus, ActionType};
use crate::taskloop::parallel::run_parallel_batch;
use crate::taskloop::{IterativeMode, TaskLoop};

use super::{Phase, PhaseContext, PhaseOutcome};

/// Run the implementation node.
///
/// The phase completes when every task is terminal. Permanently failed
/// tasks do not abort the phase here; verification judges the overall
/// result and the completion summary reports them.
pub async fn run(ctx: &PhaseContext) -> Result<PhaseOutcome> {
    ctx.log.append(
        ActionEntry::new(ActionType::PhaseStart, "implementation started")
            .phase(3)
            .status(ActionStatus::Started),
    );

    let mut batch_merged = 0usize;
    let mut batch_failed = 0usize;

    // Parallel batch mode: only independent ready tasks qualify, and only
    // when the project asked for more than one worker and the tree is a
    // git repository (worktrees need one).
    let workers = ctx.config.workflow.parallel_workers as usize;
    if workers > 1 && ctx.git.is_git_repo().await {
        let ready = tasks::get_ready_tasks(&ctx.pool).await?;
        let independent: Vec<_> = ready
            .into_iter()
            .filter(|t| t.dependencies.is_empty() && t.attempts == 0)
            .collect();

        if independent.len() > 1 {
            let worktree_base = ctx.workflow_dir.join("worktrees");
            let report = run_parallel_batch(
                &ctx.pool,
                &ctx.invoker,
                &ctx.sessions,
                Arc::clone(&ctx.claude),
                &ctx.git,
                &ctx.log,
                independent,
                worktree_base,
                workers,
            )
            .await?;
            batch_merged = report.merged.len();
            batch_failed = report.failed.len();
        }
    }

    // Sequential loop drains everything else (including batch failures
    // that still have retry budget -- they sit in `failed` status and are
    // not re-selected; permanent failure accounting happens in the loop).
    let task_loop = TaskLoop {
        pool: &ctx.pool,
        invoker: &ctx.invoker,
        enforcer: &ctx.enforcer,
        sessions: &ctx.sessions,
        implementer: ctx.claude.as_ref(),
        config: &ctx.config,
        project_dir: &ctx.project_dir,
        output_dir: ctx.phase_dir(Phase::Implementation),
        log: &ctx.log,
        iterative: IterativeMode::Auto,
    };
    let report = task_loop.run().await?;

    let progress = tasks::get_progress(&ctx.pool).await?;
    let result = serde_json::json!({
        "completed": progress.completed,
        "failed": progress.failed,
        "blocked": progress.blocked,
        "total": progress.total,
        "batch_merged": batch_merged,
        "batch_failed": batch_failed,
        "loop_iterations": report.iterations,
        "escalated": report.escalated,
    });
    workflow::update_implementation_result(&ctx.pool, &result).await?;

    if report.escalated {
        ctx.log.append(
            ActionEntry::new(ActionType::PhaseFailed, "implementation escalated")
                .phase(3)
                .status(ActionStatus::Failed),
        );
        return Ok(PhaseOutcome::escalate("task loop escalated (budget or iteration cap)"));
    }

    ctx.log.append(
        ActionEntry::new(
            ActionType::PhaseComplete,
            format!(
                "implementation finished: {}/{} tasks completed",
                progress.completed, progress.total
            ),
        )
        .phase(3),
    );

    Ok(PhaseOutcome::continue_with(result))
}
