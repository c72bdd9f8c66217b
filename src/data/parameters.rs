//! Database operations for the `parameters` table.

use crate::data::models::Parameter;
use crate::openaq::models::ParameterData;
use anyhow::{Context, Result};
use sqlx::PgPool;

/// Idempotently create a parameter, returning the persisted row.
///
/// Parameters are immutable after creation, so the insert is `DO NOTHING`;
/// when another worker raced ahead (no row returned), the now-existing row
/// is re-read instead of surfacing the conflict.
pub async fn upsert(pool: &PgPool, param: &ParameterData) -> Result<Parameter> {
    let display_name = param
        .display_name
        .clone()
        .unwrap_or_else(|| param.name.clone());

    let inserted = sqlx::query_as::<_, Parameter>(
        r#"
        INSERT INTO parameters (name, display_name, unit)
        VALUES ($1, $2, $3)
        ON CONFLICT (name) DO NOTHING
        RETURNING id, name, display_name, unit
        "#,
    )
    .bind(&param.name)
    .bind(&display_name)
    .bind(&param.units)
    .fetch_optional(pool)
    .await
    .context("failed to insert parameter")?;

    match inserted {
        Some(parameter) => Ok(parameter),
        None => sqlx::query_as::<_, Parameter>(
            "SELECT id, name, display_name, unit FROM parameters WHERE name = $1",
        )
        .bind(&param.name)
        .fetch_one(pool)
        .await
        .context("failed to re-read parameter after conflict"),
    }
}
