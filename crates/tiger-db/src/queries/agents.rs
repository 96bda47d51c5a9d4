//! Database query functions for the `agents` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Agent, AgentStatus};

/// Register an agent (or refresh its registration on restart).
///
/// Resets status to `idle` and clears any stale task assignment.
pub async fn upsert_agent(
    pool: &PgPool,
    agent_id: &str,
    role: &str,
    metadata: &serde_json::Value,
) -> Result<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (id, role, metadata) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE \
         SET role = EXCLUDED.role, \
             metadata = EXCLUDED.metadata, \
             status = 'idle', \
             current_task_id = NULL, \
             last_heartbeat = now() \
         RETURNING *",
    )
    .bind(agent_id)
    .bind(role)
    .bind(metadata)
    .fetch_one(pool)
    .await
    .context("failed to upsert agent")?;

    Ok(agent)
}

/// Fetch a single agent by ID.
pub async fn get_agent(pool: &PgPool, agent_id: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(agent_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// Refresh the agent heartbeat timestamp.
pub async fn heartbeat(pool: &PgPool, agent_id: &str) -> Result<()> {
    sqlx::query("UPDATE agents SET last_heartbeat = now() WHERE id = $1")
        .bind(agent_id)
        .execute(pool)
        .await
        .context("failed to heartbeat agent")?;

    Ok(())
}

/// Mark an agent busy on a task.
///
/// `current_task_id` is non-null iff the agent is busy, so both columns
/// move together.
pub async fn set_agent_busy(pool: &PgPool, agent_id: &str, task_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE agents SET status = 'busy', current_task_id = $1, last_heartbeat = now() \
         WHERE id = $2",
    )
    .bind(task_id)
    .bind(agent_id)
    .execute(pool)
    .await
    .context("failed to mark agent busy")?;

    Ok(())
}

/// Set an agent's status, clearing the task assignment.
pub async fn set_agent_status(pool: &PgPool, agent_id: &str, status: AgentStatus) -> Result<()> {
    sqlx::query(
        "UPDATE agents SET status = $1, current_task_id = NULL, last_heartbeat = now() \
         WHERE id = $2",
    )
    .bind(status)
    .bind(agent_id)
    .execute(pool)
    .await
    .context("failed to set agent status")?;

    Ok(())
}
