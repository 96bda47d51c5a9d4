//! Database query functions for the `leases` table.
//!
//! A lease is the in-database claim of a task by a run. It is created when
//! the run starts and deleted only by the finalizer (in the same
//! transaction as the terminal status writes) or by the contention reset.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Lease;

/// Insert a lease for a task. Returns `false` when another run already
/// holds the lease (primary-key conflict).
pub async fn try_insert_lease(
    pool: &PgPool,
    task_id: Uuid,
    run_id: Uuid,
    agent_id: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO leases (task_id, run_id, agent_id) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (task_id) DO NOTHING",
    )
    .bind(task_id)
    .bind(run_id)
    .bind(agent_id)
    .execute(pool)
    .await
    .context("failed to insert lease")?;

    Ok(result.rows_affected() == 1)
}

/// Fetch the lease for a task, if any.
pub async fn get_lease(pool: &PgPool, task_id: Uuid) -> Result<Option<Lease>> {
    let lease = sqlx::query_as::<_, Lease>("SELECT * FROM leases WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch lease")?;

    Ok(lease)
}

/// Delete the lease for a task. Idempotent.
pub async fn delete_lease(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM leases WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to delete lease")?;

    Ok(())
}
