//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{BlockReason, Task, TaskContext, TaskStatus};

/// Parameters for inserting a new task. Normally the planner's job; the
/// worker only needs this for tests and tooling.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub goal: String,
    pub notes: Option<String>,
    pub context: Option<TaskContext>,
    pub allowed_paths: Vec<String>,
    pub commands: Vec<String>,
    pub timebox_minutes: i32,
    pub role: String,
    pub retry_limit: i32,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            title: String::new(),
            goal: String::new(),
            notes: None,
            context: None,
            allowed_paths: Vec::new(),
            commands: Vec::new(),
            timebox_minutes: 30,
            role: "worker".to_owned(),
            retry_limit: 3,
        }
    }
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, status, retry_count).
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (title, goal, notes, context, allowed_paths, commands, \
         timebox_minutes, role, retry_limit) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(&new.title)
    .bind(&new.goal)
    .bind(&new.notes)
    .bind(new.context.as_ref().map(|c| Json(c.clone())))
    .bind(&new.allowed_paths)
    .bind(&new.commands)
    .bind(new.timebox_minutes)
    .bind(&new.role)
    .bind(new.retry_limit)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE only applies when the current status
/// matches `from`. Returns the number of rows affected (0 means the status
/// did not match).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    block_reason: Option<BlockReason>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, block_reason = $2, updated_at = now() \
         WHERE id = $3 AND status = $4",
    )
    .bind(to)
    .bind(block_reason)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Reset a task to `queued`, clearing its block reason.
///
/// Used when a contended lock forces the worker to hand the task back.
/// Never resurrects a task that already reached `done` or `cancelled`.
pub async fn reset_task_to_queued(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'queued', block_reason = NULL, updated_at = now() \
         WHERE id = $1 AND status NOT IN ('done', 'cancelled')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to reset task to queued")?;

    Ok(result.rows_affected())
}

/// Increment a task's retry counter.
pub async fn increment_retry_count(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE tasks SET retry_count = retry_count + 1, updated_at = now() WHERE id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to increment retry count")?;

    Ok(())
}

/// Replace a task's allowed paths (persisted policy widening during
/// recovery).
pub async fn update_allowed_paths(pool: &PgPool, task_id: Uuid, paths: &[String]) -> Result<()> {
    sqlx::query("UPDATE tasks SET allowed_paths = $1, updated_at = now() WHERE id = $2")
        .bind(paths)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to update allowed paths")?;

    Ok(())
}

/// Append a marker line to a task's free-form notes.
pub async fn append_task_note(pool: &PgPool, task_id: Uuid, note: &str) -> Result<()> {
    sqlx::query(
        "UPDATE tasks \
         SET notes = CASE WHEN notes IS NULL OR notes = '' THEN $1 \
                          ELSE notes || E'\\n' || $1 END, \
             updated_at = now() \
         WHERE id = $2",
    )
    .bind(note)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to append task note")?;

    Ok(())
}

/// A compact row describing a concurrent task, handed to the policy
/// recovery judge so it can avoid claiming another task's area.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ConcurrentTask {
    pub id: Uuid,
    pub status: TaskStatus,
    pub role: String,
    pub title: String,
    pub allowed_paths: Vec<String>,
}

/// List up to `limit` queued/running/blocked tasks other than `task_id`.
pub async fn list_concurrent_tasks(
    pool: &PgPool,
    task_id: Uuid,
    limit: i64,
) -> Result<Vec<ConcurrentTask>> {
    let rows = sqlx::query_as::<_, ConcurrentTask>(
        "SELECT id, status, role, title, allowed_paths \
         FROM tasks \
         WHERE id <> $1 AND status IN ('queued', 'running', 'blocked') \
         ORDER BY updated_at DESC \
         LIMIT $2",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list concurrent tasks")?;

    Ok(rows)
}
