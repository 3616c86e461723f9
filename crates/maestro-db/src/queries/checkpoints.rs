//! Queries for the `checkpoints` table.
//!
//! Snapshots are immutable once written; the only mutations are insert and
//! delete. Reads tolerate corrupted snapshot text: `get_decoded` yields
//! `None` with an ERROR log and `list_decoded` skips the bad row, so a
//! damaged checkpoint can never crash the workflow.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Checkpoint;
use crate::order_by;

/// Fields for a new checkpoint.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    /// 12-hex id derived by the caller from name + timestamp + project.
    pub id: String,
    pub name: String,
    pub notes: Option<String>,
    pub phase: i32,
    pub task_progress: serde_json::Value,
    /// JSON-encoded WorkflowState.
    pub state_snapshot: String,
    pub files_snapshot: Option<serde_json::Value>,
}

/// Insert a checkpoint.
pub async fn insert_checkpoint(pool: &PgPool, new: &NewCheckpoint) -> Result<Checkpoint> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO checkpoints (id, name, notes, phase, task_progress, state_snapshot, files_snapshot) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.name)
    .bind(&new.notes)
    .bind(new.phase)
    .bind(&new.task_progress)
    .bind(&new.state_snapshot)
    .bind(&new.files_snapshot)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert checkpoint {}", new.id))?;

    Ok(checkpoint)
}

/// Fetch a checkpoint row by id without decoding the snapshot.
pub async fn get_checkpoint(pool: &PgPool, id: &str) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>("SELECT * FROM checkpoints WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch checkpoint")?;
    Ok(checkpoint)
}

/// Fetch a checkpoint and decode its state snapshot.
///
/// Returns `Ok(None)` both when the row is missing and when the snapshot
/// text is corrupted; the latter logs at ERROR via
/// [`Checkpoint::decode_state`].
pub async fn get_decoded(
    pool: &PgPool,
    id: &str,
) -> Result<Option<(Checkpoint, serde_json::Value)>> {
    let Some(checkpoint) = get_checkpoint(pool, id).await? else {
        return Ok(None);
    };
    match checkpoint.decode_state() {
        Some(state) => Ok(Some((checkpoint, state))),
        None => Ok(None),
    }
}

/// List checkpoints with pagination and a validated order column.
pub async fn list_checkpoints(
    pool: &PgPool,
    limit: i64,
    offset: i64,
    requested_order: &str,
    descending: bool,
) -> Result<Vec<Checkpoint>> {
    let column = order_by::validate_order_by("checkpoints", requested_order);
    let direction = if descending { "DESC" } else { "ASC" };
    let sql =
        format!("SELECT * FROM checkpoints ORDER BY {column} {direction} LIMIT $1 OFFSET $2");

    let checkpoints = sqlx::query_as::<_, Checkpoint>(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to list checkpoints")?;

    Ok(checkpoints)
}

/// List checkpoints with decoded snapshots, skipping corrupted rows.
pub async fn list_decoded(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<(Checkpoint, serde_json::Value)>> {
    let rows = list_checkpoints(pool, limit, 0, "created_at", true).await?;
    let decoded = rows
        .into_iter()
        .filter_map(|cp| cp.decode_state().map(|state| (cp, state)))
        .collect();
    Ok(decoded)
}

/// Delete a checkpoint.
pub async fn delete_checkpoint(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM checkpoints WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete checkpoint")?;
    Ok(result.rows_affected())
}
