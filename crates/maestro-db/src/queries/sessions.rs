//! Queries for the `sessions` table.
//!
//! The partial unique index `sessions_one_active` enforces at most one
//! active session per (task, agent); replacement goes through
//! [`close_active`] first.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Session;
use crate::order_by;

/// Insert a new active session.
pub async fn insert_session(
    pool: &PgPool,
    id: &str,
    task_id: &str,
    agent: &str,
) -> Result<Session> {
    let session = sqlx::query_as::<_, Session>(
        "INSERT INTO sessions (id, task_id, agent) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(id)
    .bind(task_id)
    .bind(agent)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert session {id}"))?;

    Ok(session)
}

/// The active session for a (task, agent) pair, if any.
pub async fn get_active(pool: &PgPool, task_id: &str, agent: &str) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions \
         WHERE task_id = $1 AND agent = $2 AND status = 'active'",
    )
    .bind(task_id)
    .bind(agent)
    .fetch_optional(pool)
    .await
    .context("failed to fetch active session")?;

    Ok(session)
}

/// Fetch a session by id.
pub async fn get_session(pool: &PgPool, id: &str) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch session")?;
    Ok(session)
}

/// Touch a session after an invocation: bump the invocation count, fold in
/// cost, refresh `updated_at`.
pub async fn touch(pool: &PgPool, id: &str, cost_usd: f64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sessions \
         SET invocation_count = invocation_count + 1, \
             total_cost_usd = total_cost_usd + $2, \
             updated_at = NOW() \
         WHERE id = $1 AND status = 'active'",
    )
    .bind(id)
    .bind(cost_usd)
    .execute(pool)
    .await
    .context("failed to touch session")?;

    Ok(result.rows_affected())
}

/// Close the active session for a (task, agent) pair. Explicit close is
/// authoritative; TTL expiry is only advisory.
pub async fn close_active(pool: &PgPool, task_id: &str, agent: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sessions \
         SET status = 'closed', closed_at = NOW(), updated_at = NOW() \
         WHERE task_id = $1 AND agent = $2 AND status = 'active'",
    )
    .bind(task_id)
    .bind(agent)
    .execute(pool)
    .await
    .context("failed to close session")?;

    Ok(result.rows_affected())
}

/// Close sessions that have been idle longer than `ttl_hours`. Returns the
/// number closed.
pub async fn close_expired(pool: &PgPool, ttl_hours: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sessions \
         SET status = 'closed', closed_at = NOW(), updated_at = NOW() \
         WHERE status = 'active' \
           AND updated_at < NOW() - make_interval(hours => $1::int)",
    )
    .bind(ttl_hours)
    .execute(pool)
    .await
    .context("failed to close expired sessions")?;

    Ok(result.rows_affected())
}

/// List sessions with pagination and a validated order column.
pub async fn list_sessions(
    pool: &PgPool,
    limit: i64,
    offset: i64,
    requested_order: &str,
    descending: bool,
) -> Result<Vec<Session>> {
    let column = order_by::validate_order_by("sessions", requested_order);
    let direction = if descending { "DESC" } else { "ASC" };
    let sql = format!("SELECT * FROM sessions ORDER BY {column} {direction} LIMIT $1 OFFSET $2");

    let sessions = sqlx::query_as::<_, Session>(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to list sessions")?;

    Ok(sessions)
}

/// Delete a session.
pub async fn delete_session(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete session")?;
    Ok(result.rows_affected())
}
