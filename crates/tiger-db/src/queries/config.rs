//! Database query functions for the `config` key/value table.
//!
//! Holds the executor-relevant allowlist values (API keys, model names)
//! that the environment composer overlays onto the subprocess environment.

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Fetch the values for a set of keys. Missing keys are simply absent from
/// the returned map.
pub async fn get_values(pool: &PgPool, keys: &[String]) -> Result<HashMap<String, String>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM config WHERE key = ANY($1)")
            .bind(keys)
            .fetch_all(pool)
            .await
            .context("failed to fetch config values")?;

    Ok(rows.into_iter().collect())
}

/// Fetch a single config value.
pub async fn get_value(pool: &PgPool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("failed to fetch config value")?;

    Ok(row.map(|(v,)| v))
}

/// Upsert a config value.
pub async fn set_value(pool: &PgPool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO config (key, value) VALUES ($1, $2) \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("failed to set config value")?;

    Ok(())
}
