//! Database query functions for the `runs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{ErrorMeta, Run};

/// Insert a new run in `running` status and return it.
///
/// Fails (unique index violation) if another run for the same task is
/// already running -- that is the invariant doing its job, not a bug.
pub async fn insert_run(
    pool: &PgPool,
    task_id: Uuid,
    agent_id: &str,
    log_path: Option<&str>,
) -> Result<Run> {
    let run = sqlx::query_as::<_, Run>(
        "INSERT INTO runs (task_id, agent_id, log_path) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(agent_id)
    .bind(log_path)
    .fetch_one(pool)
    .await
    .context("failed to insert run")?;

    Ok(run)
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// List the most recent non-success runs for a task, newest first.
///
/// The worker draws retry hints from these (at most three).
pub async fn list_recent_failed_runs(pool: &PgPool, task_id: Uuid, limit: i64) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs \
         WHERE task_id = $1 AND status IN ('failed', 'cancelled') \
         ORDER BY started_at DESC \
         LIMIT $2",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent failed runs")?;

    Ok(runs)
}

/// Point a run at its final log path.
pub async fn update_run_log_path(pool: &PgPool, run_id: Uuid, log_path: &str) -> Result<()> {
    sqlx::query("UPDATE runs SET log_path = $1 WHERE id = $2")
        .bind(log_path)
        .bind(run_id)
        .execute(pool)
        .await
        .context("failed to update run log path")?;

    Ok(())
}

/// Update a running run's error metadata without finishing it.
///
/// Used to checkpoint classification before the finalizer runs.
pub async fn update_run_error_meta(pool: &PgPool, run_id: Uuid, meta: &ErrorMeta) -> Result<()> {
    sqlx::query("UPDATE runs SET error_meta = $1 WHERE id = $2")
        .bind(Json(meta.clone()))
        .bind(run_id)
        .execute(pool)
        .await
        .context("failed to update run error meta")?;

    Ok(())
}
