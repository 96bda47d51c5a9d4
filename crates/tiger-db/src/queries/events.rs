//! Database query functions for the append-only `events` audit log.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Event;

/// Append an event for a task.
pub async fn insert_event(
    pool: &PgPool,
    task_id: Uuid,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    sqlx::query("INSERT INTO events (task_id, event_type, payload) VALUES ($1, $2, $3)")
        .bind(task_id)
        .bind(event_type)
        .bind(payload)
        .execute(pool)
        .await
        .context("failed to insert event")?;

    Ok(())
}

/// List all events for a task in insertion order.
pub async fn list_events_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Event>> {
    let events =
        sqlx::query_as::<_, Event>("SELECT * FROM events WHERE task_id = $1 ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to list events for task")?;

    Ok(events)
}
