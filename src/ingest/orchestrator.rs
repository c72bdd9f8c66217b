//! Batch orchestration: partitions the full location set into units of work
//! and enqueues one job per unit, fire-and-forget.
//!
//! The orchestrator never waits for job completion; it returns a scheduling
//! summary (counts, not results). Per-unit retry is the queue's concern.

use crate::data::{kv, locations, sync_jobs};
use crate::data::sync_jobs::NewJob;
use crate::ingest::jobs::{
    KIND_LOCATIONS_PAGE, KIND_MEASUREMENT_BATCH, LocationsPageJob, MAX_RETRIES,
    MeasurementBatchJob,
};
use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, info};

/// Server-side page size of the upstream location catalog.
pub const LOCATION_PAGE_SIZE: u32 = 1000;

/// Locations per measurement-refresh batch.
pub const MEASUREMENT_BATCH_SIZE: i64 = 100;

/// app_kv key holding the last-observed upstream location total.
pub const KV_LOCATION_TOTAL: &str = "openaq.location_total";

/// Fallback catalog size used before any page fetch has observed the real
/// total.
const DEFAULT_LOCATION_TOTAL: u64 = 4877;

/// What an orchestration run enqueued.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleSummary {
    pub scheduled: usize,
    /// Units skipped because an identical job was already pending.
    pub skipped: usize,
}

/// Number of server-side pages needed to cover `total` locations. Always at
/// least one, so a cold mirror still fetches the first page and learns the
/// real total from its metadata.
pub fn page_count(total: u64, page_size: u32) -> u32 {
    let pages = total.div_ceil(u64::from(page_size.max(1)));
    u32::try_from(pages.max(1)).unwrap_or(u32::MAX)
}

/// Offsets partitioning `0..total` into `batch_size`-wide slices with no
/// gaps or overlaps.
pub fn batch_offsets(total: i64, batch_size: i64) -> Vec<i64> {
    if total <= 0 || batch_size <= 0 {
        return Vec::new();
    }
    (0..total).step_by(batch_size as usize).collect()
}

/// Enqueue one `locations_page` job per known catalog page.
pub async fn schedule_location_refresh(
    pool: &PgPool,
    fetch_history: bool,
) -> Result<ScheduleSummary> {
    let total = kv::get_u64(pool, KV_LOCATION_TOTAL)
        .await
        .context("failed to read observed location total")?
        .unwrap_or(DEFAULT_LOCATION_TOTAL);
    let pages = page_count(total, LOCATION_PAGE_SIZE);

    let jobs = (1..=pages)
        .map(|page| {
            serde_json::to_value(LocationsPageJob {
                page,
                fetch_history,
            })
            .context("failed to serialize locations page job")
        })
        .collect::<Result<Vec<_>>>()?;

    let summary = enqueue_deduplicated(pool, KIND_LOCATIONS_PAGE, jobs).await?;
    info!(
        total_locations = total,
        pages,
        scheduled = summary.scheduled,
        skipped = summary.skipped,
        "Location refresh scheduled"
    );
    Ok(summary)
}

/// Enqueue one `measurement_batch` job per offset slice of the local
/// location set.
pub async fn schedule_measurement_refresh(pool: &PgPool) -> Result<ScheduleSummary> {
    let total = locations::count(pool).await?;
    let offsets = batch_offsets(total, MEASUREMENT_BATCH_SIZE);

    let jobs = offsets
        .iter()
        .map(|&offset| {
            serde_json::to_value(MeasurementBatchJob {
                offset,
                batch_size: MEASUREMENT_BATCH_SIZE,
            })
            .context("failed to serialize measurement batch job")
        })
        .collect::<Result<Vec<_>>>()?;

    let summary = enqueue_deduplicated(pool, KIND_MEASUREMENT_BATCH, jobs).await?;
    info!(
        total_locations = total,
        batches = offsets.len(),
        batch_size = MEASUREMENT_BATCH_SIZE,
        scheduled = summary.scheduled,
        skipped = summary.skipped,
        "Measurement refresh scheduled"
    );
    Ok(summary)
}

/// Enqueue payloads of one kind, skipping any already pending in the queue.
async fn enqueue_deduplicated(
    pool: &PgPool,
    kind: &'static str,
    payloads: Vec<serde_json::Value>,
) -> Result<ScheduleSummary> {
    let existing = sync_jobs::pending_payloads(pool, kind).await?;
    let (new_payloads, skipped) = partition_new(payloads, &existing);

    let new_jobs: Vec<NewJob> = new_payloads
        .into_iter()
        .map(|payload| NewJob {
            kind,
            payload,
            max_retries: MAX_RETRIES,
        })
        .collect();

    if skipped > 0 {
        debug!(kind, count = skipped, "Skipped units with pending jobs");
    }

    let scheduled = new_jobs.len();
    sync_jobs::enqueue_many(pool, &new_jobs).await?;

    Ok(ScheduleSummary { scheduled, skipped })
}

/// Split payloads into those not yet pending and a count of those already in
/// the queue. Comparison is structural, so JSONB key-order normalization in
/// stored payloads cannot defeat the dedup.
fn partition_new(
    payloads: Vec<serde_json::Value>,
    existing: &[serde_json::Value],
) -> (Vec<serde_json::Value>, usize) {
    let mut skipped = 0;
    let fresh = payloads
        .into_iter()
        .filter(|payload| {
            if existing.contains(payload) {
                skipped += 1;
                false
            } else {
                true
            }
        })
        .collect();
    (fresh, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_offsets_partition_without_gaps_or_overlaps() {
        let offsets = batch_offsets(4877, 100);
        assert_eq!(offsets.len(), 49);
        assert_eq!(offsets.first(), Some(&0));
        assert_eq!(offsets.last(), Some(&4800));
        for window in offsets.windows(2) {
            assert_eq!(window[1] - window[0], 100);
        }
        // Final batch covers the tail: 4800..4877 fits within one slice.
        assert!(offsets.last().unwrap() + 100 >= 4877);
    }

    #[test]
    fn batch_offsets_exact_multiple() {
        let offsets = batch_offsets(400, 100);
        assert_eq!(offsets, vec![0, 100, 200, 300]);
    }

    #[test]
    fn batch_offsets_empty_mirror() {
        assert!(batch_offsets(0, 100).is_empty());
    }

    #[test]
    fn dedup_matches_payloads_with_reordered_keys() {
        let fresh = serde_json::to_value(MeasurementBatchJob {
            offset: 100,
            batch_size: 100,
        })
        .unwrap();
        // Stored payloads come back from JSONB with normalized key order.
        let stored: serde_json::Value =
            serde_json::from_str(r#"{"batch_size": 100, "offset": 100}"#).unwrap();

        let (new_payloads, skipped) = partition_new(vec![fresh], &[stored]);
        assert!(new_payloads.is_empty());
        assert_eq!(skipped, 1);
    }

    #[test]
    fn dedup_keeps_novel_payloads() {
        let fresh = serde_json::to_value(MeasurementBatchJob {
            offset: 200,
            batch_size: 100,
        })
        .unwrap();
        let stored = serde_json::to_value(MeasurementBatchJob {
            offset: 100,
            batch_size: 100,
        })
        .unwrap();

        let (new_payloads, skipped) = partition_new(vec![fresh.clone()], &[stored]);
        assert_eq!(new_payloads, vec![fresh]);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(page_count(4877, 1000), 5);
        assert_eq!(page_count(5000, 1000), 5);
        assert_eq!(page_count(5001, 1000), 6);
    }

    #[test]
    fn page_count_is_at_least_one() {
        assert_eq!(page_count(0, 1000), 1);
    }
}
