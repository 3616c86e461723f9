//! Parallel batch execution of independent tasks in git worktrees.
//!
//! Each task in a batch gets an isolated worktree, runs concurrently, and
//! merges back into the main tree sequentially. A merge failure rolls the
//! worktree back (abort + remove) and fails only that task. Workers
//! operate on private task copies and submit deltas through the reducer,
//! never on shared mutable state.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

use maestro_db::models::{StepStatus, Task};
use maestro_db::queries::tasks;

use crate::actionlog::{ActionEntry, ActionLog, ActionType};
use crate::agents::{AgentCli, InvocationRequest};
use crate::gitops::{GitOps, MergeOutcome};
use crate::invoker::AgentInvoker;
use crate::session::SessionManager;
use crate::taskloop::build_task_prompt;

/// Result of one batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub merged: Vec<String>,
    pub failed: Vec<String>,
}

/// One worker's product, handed back to the sequential merge stage.
struct WorkerResult {
    task: Task,
    worktree: crate::gitops::WorktreeHandle,
    success: bool,
    error: Option<String>,
}

/// Run a batch of independent ready tasks in parallel worktrees.
///
/// `worktree_base` is where per-task worktrees are created; it must live
/// outside the repository. Concurrency is capped by `max_workers`.
pub async fn run_parallel_batch(
    pool: &PgPool,
    invoker: &AgentInvoker,
    sessions: &SessionManager,
    implementer: Arc<dyn AgentCli>,
    git: &GitOps,
    log: &ActionLog,
    batch: Vec<Task>,
    worktree_base: PathBuf,
    max_workers: usize,
) -> Result<BatchReport> {
    let mut report = BatchReport::default();
    if batch.is_empty() {
        return Ok(report);
    }

    std::fs::create_dir_all(&worktree_base)
        .with_context(|| format!("failed to create {}", worktree_base.display()))?;

    // Phase 1: create one worktree per task, up front. A creation failure
    // aborts the batch before any agent runs; already-created worktrees
    // are rolled back.
    let mut worktrees = Vec::with_capacity(batch.len());
    for task in &batch {
        match git.add_worktree(&worktree_base, &task.id).await {
            Ok(handle) => worktrees.push((task.clone(), handle)),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "worktree creation failed, rolling back batch");
                for (_, handle) in &worktrees {
                    if let Err(remove_err) = git.remove_worktree(handle).await {
                        warn!(error = %remove_err, "rollback of worktree failed");
                    }
                }
                return Err(e).with_context(|| {
                    format!("failed to create worktree for task {}", task.id)
                });
            }
        }
    }

    // Phase 2: run workers concurrently, bounded by a semaphore.
    let semaphore = Arc::new(tokio::sync::Semaphore::new(max_workers.max(1)));
    let mut handles = Vec::with_capacity(worktrees.len());

    for (task, worktree) in worktrees {
        tasks::transition_status(pool, &task.id, StepStatus::Pending, StepStatus::InProgress)
            .await?;

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("worker semaphore closed")?;
        let invoker = invoker.clone();
        let sessions = sessions.clone();
        let implementer = Arc::clone(&implementer);
        let git = git.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit;

            let session_args = match sessions.cli_args(&task.id, implementer.name()).await {
                Ok(args) => args,
                Err(e) => {
                    return WorkerResult {
                        task,
                        worktree,
                        success: false,
                        error: Some(format!("session setup failed: {e}")),
                    };
                }
            };

            let request = InvocationRequest {
                task_id: Some(task.id.clone()),
                prompt: build_task_prompt(&task),
                session_args,
                timeout: None,
                max_cost_usd: None,
                allowed_tools: vec![
                    "Read".to_string(),
                    "Write".to_string(),
                    "Edit".to_string(),
                    "Glob".to_string(),
                    "Grep".to_string(),
                    "Bash".to_string(),
                ],
            };

            // NOTE: the worker invokes from inside the worktree so file
            // edits land on the task branch.
            let result = invoker
                .invoke_in_dir(implementer.as_ref(), &request, &worktree.path)
                .await;

            let committed = if result.success {
                match git
                    .commit_worktree(&worktree, &format!("maestro: {} work", task.id))
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "failed to commit worktree");
                        false
                    }
                }
            } else {
                false
            };

            WorkerResult {
                task,
                worktree,
                success: result.success && committed,
                error: result.error,
            }
        }));
    }

    // Phase 3: collect and merge sequentially. Merge order follows batch
    // order; each conflict rolls back only its own worktree.
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => warn!(error = %e, "batch worker panicked"),
        }
    }

    for result in results {
        let task_id = result.task.id.clone();

        let merged = if result.success {
            match git
                .merge_branch(&result.worktree.branch, &format!("merge task {task_id}"))
                .await
            {
                Ok(MergeOutcome::Merged { hash }) => {
                    info!(task_id = %task_id, hash = %hash, "merged task worktree");
                    true
                }
                Ok(MergeOutcome::Conflict { details }) => {
                    warn!(task_id = %task_id, details = %details, "merge conflict, task failed");
                    set_task_error(pool, &task_id, &format!("merge conflict: {details}")).await;
                    false
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "merge failed");
                    set_task_error(pool, &task_id, &format!("merge failed: {e}")).await;
                    false
                }
            }
        } else {
            if let Some(error) = &result.error {
                set_task_error(pool, &task_id, error).await;
            }
            false
        };

        if merged {
            tasks::transition_status(pool, &task_id, StepStatus::InProgress, StepStatus::Completed)
                .await?;
            log.append(
                ActionEntry::new(ActionType::TaskComplete, format!("{task_id} merged"))
                    .task(task_id.clone()),
            );
            report.merged.push(task_id);
        } else {
            tasks::transition_status(pool, &task_id, StepStatus::InProgress, StepStatus::Failed)
                .await?;
            log.append(
                ActionEntry::new(ActionType::TaskFailed, format!("{task_id} failed in batch"))
                    .task(task_id.clone()),
            );
            report.failed.push(task_id);
        }

        if let Err(e) = git.remove_worktree(&result.worktree).await {
            warn!(error = %e, "failed to remove batch worktree");
        }
    }

    Ok(report)
}

async fn set_task_error(pool: &PgPool, task_id: &str, error: &str) {
    match tasks::get_task(pool, task_id).await {
        Ok(Some(mut task)) => {
            task.error = Some(error.to_string());
            if let Err(e) = tasks::update_task(pool, &task).await {
                warn!(task_id, error = %e, "failed to record task error");
            }
        }
        Ok(None) => warn!(task_id, "task missing while recording error"),
        Err(e) => warn!(task_id, error = %e, "failed to load task for error recording"),
    }
}
