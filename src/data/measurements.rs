//! Measurement recording: append-only rows deduplicated on
//! (sensor, timestamp), plus the monotonic last-reading cache on the sensor.

use crate::data::models::Sensor;
use crate::openaq::models::RawMeasurement;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;

/// What happened to a single raw reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new measurement row was written.
    Inserted,
    /// The (sensor, timestamp) pair already existed; no row written.
    Duplicate,
    /// The payload carried no recognizable timestamp or no value; nothing
    /// written.
    Skipped,
}

/// Record one raw reading for a sensor.
///
/// Runs as one transaction: a conditional insert that ignores redelivered
/// (sensor, timestamp) pairs, then a guarded update that advances the
/// sensor's `last_value`/`last_updated` only when the incoming timestamp is
/// strictly newer. Both statements are safe under concurrent writers and
/// out-of-order delivery; `last_updated` never moves backward.
pub async fn record(
    pool: &PgPool,
    sensor: &Sensor,
    raw: &RawMeasurement,
) -> Result<RecordOutcome> {
    let Some(timestamp) = raw.timestamp() else {
        warn!(
            sensor_openaq_id = sensor.openaq_id,
            "Unknown timestamp format in measurement, skipping"
        );
        return Ok(RecordOutcome::Skipped);
    };
    let Some(value) = raw.value else {
        warn!(
            sensor_openaq_id = sensor.openaq_id,
            "Measurement carries no value, skipping"
        );
        return Ok(RecordOutcome::Skipped);
    };

    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let inserted = insert_if_absent(&mut tx, sensor.id, value, timestamp).await?;
    advance_latest(&mut tx, sensor.id, value, timestamp).await?;

    tx.commit().await.context("failed to commit measurement")?;

    Ok(if inserted {
        RecordOutcome::Inserted
    } else {
        RecordOutcome::Duplicate
    })
}

/// Append a measurement row unless the (sensor, timestamp) pair exists.
/// Returns whether a row was written.
async fn insert_if_absent(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    sensor_id: i64,
    value: f64,
    timestamp: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO measurements (sensor_id, value, timestamp)
        VALUES ($1, $2, $3)
        ON CONFLICT (sensor_id, timestamp) DO NOTHING
        "#,
    )
    .bind(sensor_id)
    .bind(value)
    .bind(timestamp)
    .execute(&mut **tx)
    .await
    .context("failed to insert measurement")?;
    Ok(result.rows_affected() > 0)
}

/// Advance the sensor's cached last reading, but only forward in time.
async fn advance_latest(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    sensor_id: i64,
    value: f64,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sensors
        SET last_value = $2, last_updated = $3
        WHERE id = $1 AND (last_updated IS NULL OR last_updated < $3)
        "#,
    )
    .bind(sensor_id)
    .bind(value)
    .bind(timestamp)
    .execute(&mut **tx)
    .await
    .context("failed to advance sensor last reading")?;
    Ok(())
}
