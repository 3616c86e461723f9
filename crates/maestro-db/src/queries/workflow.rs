//! Queries for the singleton `workflow_state` row.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{ExecutionMode, NextDecision, WorkflowState};

/// Fetch the workflow state, if one has been created.
pub async fn get_state(pool: &PgPool) -> Result<Option<WorkflowState>> {
    let state = sqlx::query_as::<_, WorkflowState>("SELECT * FROM workflow_state LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow state")?;

    Ok(state)
}

/// Create the workflow state row. Fails if one already exists (the
/// singleton index enforces this server-side).
pub async fn create_state(
    pool: &PgPool,
    project_dir: &str,
    execution_mode: ExecutionMode,
    end_phase: i32,
) -> Result<WorkflowState> {
    let state = sqlx::query_as::<_, WorkflowState>(
        "INSERT INTO workflow_state (project_dir, execution_mode, end_phase) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(project_dir)
    .bind(execution_mode)
    .bind(end_phase)
    .fetch_one(pool)
    .await
    .context("failed to create workflow state")?;

    Ok(state)
}

/// Update the current phase and decision.
pub async fn update_phase(
    pool: &PgPool,
    current_phase: i32,
    next_decision: NextDecision,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE workflow_state \
         SET current_phase = $1, next_decision = $2, updated_at = NOW()",
    )
    .bind(current_phase)
    .bind(next_decision)
    .execute(pool)
    .await
    .context("failed to update workflow phase")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow state not initialized");
    }
    Ok(())
}

/// Replace the per-phase status map.
pub async fn update_phase_status(pool: &PgPool, phase_status: &serde_json::Value) -> Result<()> {
    sqlx::query("UPDATE workflow_state SET phase_status = $1, updated_at = NOW()")
        .bind(phase_status)
        .execute(pool)
        .await
        .context("failed to update phase status map")?;
    Ok(())
}

/// Store the parsed plan.
pub async fn update_plan(pool: &PgPool, plan: &serde_json::Value) -> Result<()> {
    sqlx::query("UPDATE workflow_state SET plan = $1, updated_at = NOW()")
        .bind(plan)
        .execute(pool)
        .await
        .context("failed to store plan")?;
    Ok(())
}

/// Store reviewer feedback for validation (phase 2) or verification
/// (phase 4).
pub async fn update_feedback(
    pool: &PgPool,
    phase: i32,
    feedback: &serde_json::Value,
) -> Result<()> {
    let column = match phase {
        2 => "validation_feedback",
        4 => "verification_feedback",
        other => anyhow::bail!("phase {other} does not record reviewer feedback"),
    };
    // `column` comes from the match above, never from the caller's input.
    let sql = format!("UPDATE workflow_state SET {column} = $1, updated_at = NOW()");
    sqlx::query(&sql)
        .bind(feedback)
        .execute(pool)
        .await
        .with_context(|| format!("failed to store {column}"))?;
    Ok(())
}

/// Store the implementation result summary.
pub async fn update_implementation_result(
    pool: &PgPool,
    result: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE workflow_state SET implementation_result = $1, updated_at = NOW()")
        .bind(result)
        .execute(pool)
        .await
        .context("failed to store implementation result")?;
    Ok(())
}

/// Bump the plan-rejection iteration counter, returning the new value.
pub async fn increment_iteration(pool: &PgPool) -> Result<i32> {
    let (count,): (i32,) = sqlx::query_as(
        "UPDATE workflow_state \
         SET iteration_count = iteration_count + 1, updated_at = NOW() \
         RETURNING iteration_count",
    )
    .fetch_one(pool)
    .await
    .context("failed to increment iteration count")?;
    Ok(count)
}

/// Store the tracked-file checksum snapshot.
pub async fn update_context_snapshot(
    pool: &PgPool,
    snapshot: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE workflow_state SET context_snapshot = $1, updated_at = NOW()")
        .bind(snapshot)
        .execute(pool)
        .await
        .context("failed to store context snapshot")?;
    Ok(())
}

/// Append a `{phase, hash, message, timestamp}` record to `git_commits`.
pub async fn append_git_commit(pool: &PgPool, commit: &serde_json::Value) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_state \
         SET git_commits = git_commits || $1::jsonb, updated_at = NOW()",
    )
    .bind(commit)
    .execute(pool)
    .await
    .context("failed to append git commit record")?;
    Ok(())
}

/// Fold token usage into the running totals.
pub async fn add_token_usage(pool: &PgPool, input: i64, output: i64) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_state \
         SET token_usage = jsonb_build_object( \
                 'input', COALESCE((token_usage->>'input')::bigint, 0) + $1, \
                 'output', COALESCE((token_usage->>'output')::bigint, 0) + $2), \
             updated_at = NOW()",
    )
    .bind(input)
    .bind(output)
    .execute(pool)
    .await
    .context("failed to add token usage")?;
    Ok(())
}

/// Restore a full state snapshot (checkpoint rollback path).
///
/// Only mutable workflow fields are written; identity and `created_at`
/// stay as they are.
pub async fn restore_snapshot(pool: &PgPool, snapshot: &WorkflowState) -> Result<()> {
    let result = sqlx::query(
        "UPDATE workflow_state SET \
             current_phase = $1, \
             phase_status = $2, \
             iteration_count = $3, \
             plan = $4, \
             validation_feedback = $5, \
             verification_feedback = $6, \
             implementation_result = $7, \
             next_decision = $8, \
             end_phase = $9, \
             context_snapshot = $10, \
             token_usage = $11, \
             git_commits = $12, \
             updated_at = NOW()",
    )
    .bind(snapshot.current_phase)
    .bind(&snapshot.phase_status)
    .bind(snapshot.iteration_count)
    .bind(&snapshot.plan)
    .bind(&snapshot.validation_feedback)
    .bind(&snapshot.verification_feedback)
    .bind(&snapshot.implementation_result)
    .bind(snapshot.next_decision)
    .bind(snapshot.end_phase)
    .bind(&snapshot.context_snapshot)
    .bind(&snapshot.token_usage)
    .bind(&snapshot.git_commits)
    .execute(pool)
    .await
    .context("failed to restore workflow snapshot")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow state not initialized, cannot restore snapshot");
    }
    Ok(())
}

/// Delete the workflow state (explicit reset only).
pub async fn delete_state(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM workflow_state")
        .execute(pool)
        .await
        .context("failed to delete workflow state")?;
    Ok(result.rows_affected())
}
