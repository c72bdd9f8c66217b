//! Database operations for the `sensors` table.

use crate::data::models::Sensor;
use anyhow::{Context, Result};
use sqlx::PgPool;

const COLUMNS: &str = "id, openaq_id, location_id, parameter_id, last_value, last_updated";

/// Idempotently create a sensor, returning the persisted row.
///
/// The location and parameter rows must already exist. Sensors are immutable
/// after creation except for the last-reading cache, so the insert is
/// `DO NOTHING` with a re-read when a concurrent worker raced ahead.
pub async fn upsert(
    pool: &PgPool,
    openaq_id: i64,
    location_id: i64,
    parameter_id: i64,
) -> Result<Sensor> {
    let inserted = sqlx::query_as::<_, Sensor>(&format!(
        r#"
        INSERT INTO sensors (openaq_id, location_id, parameter_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (openaq_id) DO NOTHING
        RETURNING {COLUMNS}
        "#
    ))
    .bind(openaq_id)
    .bind(location_id)
    .bind(parameter_id)
    .fetch_optional(pool)
    .await
    .context("failed to insert sensor")?;

    match inserted {
        Some(sensor) => Ok(sensor),
        None => sqlx::query_as::<_, Sensor>(&format!(
            "SELECT {COLUMNS} FROM sensors WHERE openaq_id = $1"
        ))
        .bind(openaq_id)
        .fetch_one(pool)
        .await
        .context("failed to re-read sensor after conflict"),
    }
}

/// All sensors belonging to a location.
pub async fn by_location(pool: &PgPool, location_id: i64) -> Result<Vec<Sensor>> {
    sqlx::query_as::<_, Sensor>(&format!(
        "SELECT {COLUMNS} FROM sensors WHERE location_id = $1"
    ))
    .bind(location_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch sensors for location")
}
