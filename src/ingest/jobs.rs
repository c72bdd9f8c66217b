//! Job payload types for the sync queue.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const KIND_LOCATIONS_PAGE: &str = "locations_page";
pub const KIND_MEASUREMENT_BATCH: &str = "measurement_batch";

/// Retry attempts allowed per job beyond the first run.
pub const MAX_RETRIES: i32 = 2;

/// Fixed delay before a failed job becomes eligible again.
pub const RETRY_DELAY: Duration = Duration::from_secs(300);

/// Refresh one server-side page of the upstream location catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationsPageJob {
    pub page: u32,
    /// Also backfill recent history from the paged measurements endpoint.
    #[serde(default)]
    pub fetch_history: bool,
}

/// Refresh latest readings for one offset-based slice of local locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementBatchJob {
    pub offset: i64,
    pub batch_size: i64,
}

/// A decoded unit of work from the queue.
#[derive(Debug)]
pub enum JobKind {
    LocationsPage(LocationsPageJob),
    MeasurementBatch(MeasurementBatchJob),
}

impl JobKind {
    /// Decode a queue row's kind and payload. Failure here means the row is
    /// corrupt and must not be retried.
    pub fn decode(kind: &str, payload: serde_json::Value) -> Result<Self, anyhow::Error> {
        match kind {
            KIND_LOCATIONS_PAGE => Ok(Self::LocationsPage(serde_json::from_value(payload)?)),
            KIND_MEASUREMENT_BATCH => Ok(Self::MeasurementBatch(serde_json::from_value(payload)?)),
            other => Err(anyhow::anyhow!("unknown job kind: {other}")),
        }
    }
}

/// Failure classification for job processing.
#[derive(Debug)]
pub enum JobError {
    /// Transient; the queue's retry policy applies.
    Recoverable(anyhow::Error),
    /// The job itself is corrupt; retrying cannot help.
    Unrecoverable(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn locations_page_roundtrip() {
        let job = LocationsPageJob {
            page: 3,
            fetch_history: true,
        };
        let payload = serde_json::to_value(&job).unwrap();
        match JobKind::decode(KIND_LOCATIONS_PAGE, payload).unwrap() {
            JobKind::LocationsPage(decoded) => assert_eq!(decoded, job),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn fetch_history_defaults_to_false() {
        let payload = json!({ "page": 1 });
        match JobKind::decode(KIND_LOCATIONS_PAGE, payload).unwrap() {
            JobKind::LocationsPage(decoded) => assert!(!decoded.fetch_history),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn measurement_batch_roundtrip() {
        let job = MeasurementBatchJob {
            offset: 4800,
            batch_size: 100,
        };
        let payload = serde_json::to_value(&job).unwrap();
        match JobKind::decode(KIND_MEASUREMENT_BATCH, payload).unwrap() {
            JobKind::MeasurementBatch(decoded) => assert_eq!(decoded, job),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(JobKind::decode("prune_everything", json!({})).is_err());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(JobKind::decode(KIND_MEASUREMENT_BATCH, json!({ "offset": "a" })).is_err());
    }
}
