//! Database query functions for the `queue_jobs` table.
//!
//! A minimal per-agent work queue. External brokers can replace this by
//! implementing the core `TaskQueue` trait; the table keeps the default
//! deployment to one moving part (Postgres).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

/// A claimed queue job payload.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueJob {
    pub id: i64,
    pub task_id: Uuid,
    pub agent_id: String,
}

/// Enqueue a job on a named queue.
pub async fn enqueue_job(pool: &PgPool, queue: &str, task_id: Uuid, agent_id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO queue_jobs (queue, task_id, agent_id) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(queue)
    .bind(task_id)
    .bind(agent_id)
    .fetch_one(pool)
    .await
    .context("failed to enqueue job")?;

    Ok(row.0)
}

/// Claim the next unclaimed job on a queue.
///
/// Uses `FOR UPDATE SKIP LOCKED` so concurrent pollers never double-claim.
/// Claiming marks the row rather than deleting it; delivery is therefore
/// at-least-once and the worker must be idempotent (runtime lock + lease).
pub async fn claim_next_job(pool: &PgPool, queue: &str) -> Result<Option<QueueJob>> {
    let job = sqlx::query_as::<_, QueueJob>(
        "UPDATE queue_jobs \
         SET claimed_at = now() \
         WHERE id = ( \
             SELECT id FROM queue_jobs \
             WHERE queue = $1 AND claimed_at IS NULL \
             ORDER BY id \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1 \
         ) \
         RETURNING id, task_id, agent_id",
    )
    .bind(queue)
    .fetch_optional(pool)
    .await
    .context("failed to claim queue job")?;

    Ok(job)
}

/// Delete a job after the handler has finished with it.
pub async fn delete_job(pool: &PgPool, job_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .context("failed to delete queue job")?;

    Ok(())
}

/// Release a claimed job back to the queue (redelivery).
pub async fn release_job(pool: &PgPool, job_id: i64) -> Result<()> {
    sqlx::query("UPDATE queue_jobs SET claimed_at = NULL WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .context("failed to release queue job")?;

    Ok(())
}
