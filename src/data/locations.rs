//! Database operations for the `locations` table.

use crate::data::models::Location;
use crate::openaq::models::LocationData;
use anyhow::{Context, Result};
use sqlx::PgPool;

/// Idempotently create or refresh a location from an upstream payload.
///
/// The atomic `ON CONFLICT` upsert makes concurrent sightings of the same
/// location from overlapping batches safe: the last writer's mutable fields
/// win, and `last_updated` is stamped on every sighting either way.
pub async fn upsert(pool: &PgPool, loc: &LocationData) -> Result<Location> {
    let (latitude, longitude) = match &loc.coordinates {
        Some(c) => (Some(c.latitude), Some(c.longitude)),
        None => (None, None),
    };

    sqlx::query_as::<_, Location>(
        r#"
        INSERT INTO locations (openaq_id, name, locality, country_code, latitude, longitude, is_mobile, last_updated)
        VALUES ($1, $2, $3, $4, $5, $6, $7, now())
        ON CONFLICT (openaq_id)
        DO UPDATE SET
            name = EXCLUDED.name,
            locality = EXCLUDED.locality,
            latitude = EXCLUDED.latitude,
            longitude = EXCLUDED.longitude,
            is_mobile = EXCLUDED.is_mobile,
            last_updated = now()
        RETURNING id, openaq_id, name, locality, country_code, latitude, longitude, is_mobile, last_updated
        "#,
    )
    .bind(loc.id)
    .bind(&loc.name)
    .bind(&loc.locality)
    .bind(&loc.country.code)
    .bind(latitude)
    .bind(longitude)
    .bind(loc.is_mobile)
    .fetch_one(pool)
    .await
    .context("failed to upsert location")
}

/// Total number of locally known locations.
pub async fn count(pool: &PgPool) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM locations")
        .fetch_one(pool)
        .await
        .context("failed to count locations")
}

/// One offset-based slice of the location set, ordered by id so concurrent
/// batches partition the table deterministically.
pub async fn page(pool: &PgPool, offset: i64, limit: i64) -> Result<Vec<Location>> {
    sqlx::query_as::<_, Location>(
        r#"
        SELECT id, openaq_id, name, locality, country_code, latitude, longitude, is_mobile, last_updated
        FROM locations
        ORDER BY id
        OFFSET $1
        LIMIT $2
        "#,
    )
    .bind(offset)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch location page")
}
