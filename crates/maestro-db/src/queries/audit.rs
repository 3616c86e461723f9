//! Queries for the append-only `audit_entries` table.
//!
//! Entries are opened when an invocation starts and finished exactly once
//! with the result fields. Nothing here exposes a general UPDATE: the
//! result commit is the only legal mutation.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AuditEntry, InvocationStatus};
use crate::order_by;

/// Fields captured when an invocation starts.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub agent: String,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    /// SHA-256 of the prompt; the prompt text itself is never persisted.
    pub prompt_hash: String,
    pub prompt_length: i64,
    pub command_args: Vec<String>,
}

/// Result fields committed when the invocation finishes.
#[derive(Debug, Clone)]
pub struct AuditResult {
    pub exit_code: Option<i32>,
    pub status: InvocationStatus,
    pub duration_seconds: f64,
    pub output_length: i64,
    pub error_length: i64,
    pub parsed_output_type: String,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
}

/// Open an audit entry for an invocation that is about to run.
pub async fn open_entry(pool: &PgPool, new: &NewAuditEntry) -> Result<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO audit_entries (agent, task_id, session_id, prompt_hash, \
                                    prompt_length, command_args) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING id",
    )
    .bind(&new.agent)
    .bind(&new.task_id)
    .bind(&new.session_id)
    .bind(&new.prompt_hash)
    .bind(new.prompt_length)
    .bind(&new.command_args)
    .fetch_one(pool)
    .await
    .context("failed to open audit entry")?;

    Ok(id)
}

/// Commit the result onto an open entry. This is the single permitted
/// mutation; callers must not invoke it twice for one id.
pub async fn finish_entry(pool: &PgPool, id: Uuid, result: &AuditResult) -> Result<()> {
    let outcome = sqlx::query(
        "UPDATE audit_entries SET \
             exit_code = $2, \
             status = $3, \
             duration_seconds = $4, \
             output_length = $5, \
             error_length = $6, \
             parsed_output_type = $7, \
             cost_usd = $8, \
             model = $9 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(result.exit_code)
    .bind(result.status)
    .bind(result.duration_seconds)
    .bind(result.output_length)
    .bind(result.error_length)
    .bind(&result.parsed_output_type)
    .bind(result.cost_usd)
    .bind(&result.model)
    .execute(pool)
    .await
    .context("failed to finish audit entry")?;

    if outcome.rows_affected() == 0 {
        anyhow::bail!("audit entry {id} not found");
    }
    Ok(())
}

/// Record the session id once the invoker has extracted it from output.
pub async fn set_session_id(pool: &PgPool, id: Uuid, session_id: &str) -> Result<()> {
    sqlx::query("UPDATE audit_entries SET session_id = $2 WHERE id = $1")
        .bind(id)
        .bind(session_id)
        .execute(pool)
        .await
        .context("failed to set audit session id")?;
    Ok(())
}

/// Fetch a single entry by id.
pub async fn get_entry(pool: &PgPool, id: Uuid) -> Result<Option<AuditEntry>> {
    let entry = sqlx::query_as::<_, AuditEntry>("SELECT * FROM audit_entries WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch audit entry")?;
    Ok(entry)
}

/// List entries with pagination and a validated order column.
pub async fn list_entries(
    pool: &PgPool,
    limit: i64,
    offset: i64,
    requested_order: &str,
    descending: bool,
) -> Result<Vec<AuditEntry>> {
    let column = order_by::validate_order_by("audit_entries", requested_order);
    let direction = if descending { "DESC" } else { "ASC" };
    let sql =
        format!("SELECT * FROM audit_entries ORDER BY {column} {direction} LIMIT $1 OFFSET $2");

    let entries = sqlx::query_as::<_, AuditEntry>(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to list audit entries")?;

    Ok(entries)
}

/// All entries for one task, newest first.
pub async fn list_for_task(pool: &PgPool, task_id: &str, limit: i64) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit_entries WHERE task_id = $1 \
         ORDER BY created_at DESC LIMIT $2",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list audit entries for task")?;

    Ok(entries)
}

/// Aggregate cost and invocation counts, for the completion summary.
#[derive(Debug, Clone, Default)]
pub struct AuditStatistics {
    pub total_invocations: i64,
    pub total_cost_usd: f64,
    pub failures: i64,
    pub timeouts: i64,
}

/// Compute summary statistics over all entries.
pub async fn get_statistics(pool: &PgPool) -> Result<AuditStatistics> {
    let row: (i64, Option<f64>, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), \
                COALESCE(SUM(cost_usd), 0), \
                COUNT(*) FILTER (WHERE status = 'failed'), \
                COUNT(*) FILTER (WHERE status = 'timeout') \
         FROM audit_entries",
    )
    .fetch_one(pool)
    .await
    .context("failed to compute audit statistics")?;

    Ok(AuditStatistics {
        total_invocations: row.0,
        total_cost_usd: row.1.unwrap_or(0.0),
        failures: row.2,
        timeouts: row.3,
    })
}
