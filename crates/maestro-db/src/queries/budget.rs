//! Queries for the append-only `budget_records` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::BudgetRecord;
use crate::order_by;

/// Fields for one spend record.
#[derive(Debug, Clone)]
pub struct NewBudgetRecord {
    pub task_id: String,
    pub agent: String,
    pub cost_usd: f64,
    pub tokens_input: Option<i64>,
    pub tokens_output: Option<i64>,
    pub model: Option<String>,
}

/// Append one spend record. The CHECK constraint rejects negative cost.
pub async fn record_spend(pool: &PgPool, new: &NewBudgetRecord) -> Result<BudgetRecord> {
    let record = sqlx::query_as::<_, BudgetRecord>(
        "INSERT INTO budget_records (task_id, agent, cost_usd, tokens_input, tokens_output, model) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(&new.task_id)
    .bind(&new.agent)
    .bind(new.cost_usd)
    .bind(new.tokens_input)
    .bind(new.tokens_output)
    .bind(&new.model)
    .fetch_one(pool)
    .await
    .context("failed to record spend")?;

    Ok(record)
}

/// Total spend for one task.
pub async fn task_spent(pool: &PgPool, task_id: &str) -> Result<f64> {
    let (total,): (Option<f64>,) =
        sqlx::query_as("SELECT SUM(cost_usd) FROM budget_records WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await
            .context("failed to sum task spend")?;

    Ok(total.unwrap_or(0.0))
}

/// Total spend across the project.
pub async fn project_spent(pool: &PgPool) -> Result<f64> {
    let (total,): (Option<f64>,) = sqlx::query_as("SELECT SUM(cost_usd) FROM budget_records")
        .fetch_one(pool)
        .await
        .context("failed to sum project spend")?;

    Ok(total.unwrap_or(0.0))
}

/// Token totals across the project: (input, output).
pub async fn token_totals(pool: &PgPool) -> Result<(i64, i64)> {
    let row: (Option<i64>, Option<i64>) =
        sqlx::query_as("SELECT SUM(tokens_input), SUM(tokens_output) FROM budget_records")
            .fetch_one(pool)
            .await
            .context("failed to sum token totals")?;

    Ok((row.0.unwrap_or(0), row.1.unwrap_or(0)))
}

/// List records with pagination and a validated order column.
pub async fn list_records(
    pool: &PgPool,
    limit: i64,
    offset: i64,
    requested_order: &str,
    descending: bool,
) -> Result<Vec<BudgetRecord>> {
    let column = order_by::validate_order_by("budget_records", requested_order);
    let direction = if descending { "DESC" } else { "ASC" };
    let sql =
        format!("SELECT * FROM budget_records ORDER BY {column} {direction} LIMIT $1 OFFSET $2");

    let records = sqlx::query_as::<_, BudgetRecord>(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to list budget records")?;

    Ok(records)
}
