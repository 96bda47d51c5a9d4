//! Database query functions for the `artifacts` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Artifact, ArtifactKind};

/// Insert an artifact row for a run.
pub async fn insert_artifact(
    pool: &PgPool,
    run_id: Uuid,
    kind: ArtifactKind,
    reference: &str,
    url: Option<&str>,
    metadata: &serde_json::Value,
) -> Result<Artifact> {
    let artifact = sqlx::query_as::<_, Artifact>(
        "INSERT INTO artifacts (run_id, kind, reference, url, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(run_id)
    .bind(kind)
    .bind(reference)
    .bind(url)
    .bind(metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert artifact")?;

    Ok(artifact)
}

/// List all artifacts for a run, oldest first.
pub async fn list_artifacts_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<Artifact>> {
    let artifacts = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts WHERE run_id = $1 ORDER BY created_at ASC",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to list artifacts for run")?;

    Ok(artifacts)
}
