//! Row types for the mirror tables and the job queue.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A monitoring site in the upstream network. Created on first sighting,
/// mutable fields refreshed on every subsequent sighting, never deleted by
/// the pipeline.
#[derive(Debug, Clone, FromRow)]
pub struct Location {
    pub id: i64,
    pub openaq_id: i64,
    pub name: String,
    pub locality: Option<String>,
    pub country_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_mobile: bool,
    pub last_updated: DateTime<Utc>,
}

/// A measured quantity type, unique by name and immutable after creation.
#[derive(Debug, Clone, FromRow)]
pub struct Parameter {
    pub id: i64,
    pub name: String,
    pub display_name: Option<String>,
    pub unit: String,
}

/// A single measuring channel at a location. `last_value`/`last_updated`
/// cache the most recent reading and only ever advance forward in time.
#[derive(Debug, Clone, FromRow)]
pub struct Sensor {
    pub id: i64,
    pub openaq_id: i64,
    pub location_id: i64,
    pub parameter_id: i64,
    pub last_value: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// A queued unit of ingestion work.
#[derive(Debug, Clone, FromRow)]
pub struct SyncJob {
    pub id: i32,
    pub kind: String,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub execute_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
}
