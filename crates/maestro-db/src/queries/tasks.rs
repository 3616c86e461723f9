//! Queries for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{StepStatus, Task, TaskPriority};
use crate::order_by;

/// Fields accepted when creating a task from a parsed plan.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub id: String,
    pub title: String,
    pub user_story: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub dependencies: Vec<String>,
    pub files_to_create: Vec<String>,
    pub files_to_modify: Vec<String>,
    pub test_files: Vec<String>,
    pub priority: Option<TaskPriority>,
    pub max_attempts: Option<i32>,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (status, attempts, timestamps).
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, title, user_story, acceptance_criteria, dependencies, \
                            files_to_create, files_to_modify, test_files, priority, max_attempts) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.title)
    .bind(&new.user_story)
    .bind(&new.acceptance_criteria)
    .bind(&new.dependencies)
    .bind(&new.files_to_create)
    .bind(&new.files_to_modify)
    .bind(&new.test_files)
    .bind(new.priority.unwrap_or(TaskPriority::Medium))
    .bind(new.max_attempts.unwrap_or(3))
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert task {}", new.id))?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks with pagination. The order column is validated against the
/// allowlist; hostile input degrades to `created_at`.
pub async fn list_tasks(
    pool: &PgPool,
    limit: i64,
    offset: i64,
    requested_order: &str,
    descending: bool,
) -> Result<Vec<Task>> {
    let column = order_by::validate_order_by("tasks", requested_order);
    let direction = if descending { "DESC" } else { "ASC" };
    let sql = format!("SELECT * FROM tasks ORDER BY {column} {direction} LIMIT $1 OFFSET $2");

    let tasks = sqlx::query_as::<_, Task>(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}

/// List every task, ordered by creation time. The task loop works on the
/// full set; plans stay small enough that pagination would only obscure it.
pub async fn list_all_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list all tasks")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Optimistic locking: the WHERE clause pins the expected `from` status, so
/// a concurrent writer that got there first makes this a no-op. Returns the
/// number of rows affected (0 means the status did not match).
pub async fn transition_status(
    pool: &PgPool,
    id: &str,
    from: StepStatus,
    to: StepStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = NOW() \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Persist the merged result of a task update (reducer output).
pub async fn update_task(pool: &PgPool, task: &Task) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks SET \
             title = $2, \
             user_story = $3, \
             acceptance_criteria = $4, \
             dependencies = $5, \
             files_to_create = $6, \
             files_to_modify = $7, \
             test_files = $8, \
             files_created = $9, \
             files_modified = $10, \
             test_results = $11, \
             status = $12, \
             priority = $13, \
             attempts = $14, \
             max_attempts = $15, \
             implementation_notes = $16, \
             error = $17, \
             updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(&task.id)
    .bind(&task.title)
    .bind(&task.user_story)
    .bind(&task.acceptance_criteria)
    .bind(&task.dependencies)
    .bind(&task.files_to_create)
    .bind(&task.files_to_modify)
    .bind(&task.test_files)
    .bind(&task.files_created)
    .bind(&task.files_modified)
    .bind(&task.test_results)
    .bind(task.status)
    .bind(task.priority)
    .bind(task.attempts)
    .bind(task.max_attempts)
    .bind(&task.implementation_notes)
    .bind(&task.error)
    .execute(pool)
    .await
    .with_context(|| format!("failed to update task {}", task.id))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {} not found", task.id);
    }
    Ok(())
}

/// Tasks in `pending` whose dependencies are all `completed`.
pub async fn get_ready_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         WHERE t.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM tasks dep \
               WHERE dep.id = ANY(t.dependencies) AND dep.status != 'completed' \
           ) \
         ORDER BY t.priority = 'high' DESC, t.priority = 'medium' DESC, t.created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to get ready tasks")?;

    Ok(tasks)
}

/// Status counts across all tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskProgress {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub blocked: i64,
    pub total: i64,
}

/// Count tasks per status.
pub async fn get_progress(pool: &PgPool) -> Result<TaskProgress> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to get task progress")?;

    let mut progress = TaskProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "in_progress" => progress.in_progress = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            "blocked" => progress.blocked = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

/// Delete a task.
pub async fn delete_task(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete task")?;
    Ok(result.rows_affected())
}

/// Delete all tasks (explicit reset only).
pub async fn delete_all_tasks(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks")
        .execute(pool)
        .await
        .context("failed to delete tasks")?;
    Ok(result.rows_affected())
}
