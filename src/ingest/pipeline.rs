//! Per-job processing: upserting reference entities and recording
//! measurements for one page or batch of locations.
//!
//! Failure isolation is layered: a bad reading never fails its location, a
//! bad location never fails its page or batch. Only failures that make the
//! whole unit of work meaningless (the page fetch itself, the local
//! location query) propagate to the worker's retry machinery.

use crate::data::models::{Location, Sensor};
use crate::data::{kv, locations, measurements, parameters, sensors};
use crate::data::measurements::RecordOutcome;
use crate::ingest::jobs::{LocationsPageJob, MeasurementBatchJob};
use crate::ingest::orchestrator::{KV_LOCATION_TOTAL, LOCATION_PAGE_SIZE};
use crate::openaq::OpenAqApi;
use crate::openaq::models::{LocationData, RawMeasurement, SensorData};
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How far back the optional history backfill reaches.
const HISTORY_BACKFILL_DAYS: i64 = 10;

/// Counts reported back to the job queue's audit log.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobCounts {
    pub locations_processed: u32,
    pub measurements_recorded: u32,
}

/// Executes units of ingestion work against the upstream API and the mirror.
pub struct Ingestor {
    api: Arc<OpenAqApi>,
    pool: PgPool,
    country_id: i64,
}

impl Ingestor {
    pub fn new(api: Arc<OpenAqApi>, pool: PgPool, country_id: i64) -> Self {
        Self {
            api,
            pool,
            country_id,
        }
    }

    /// Process one server-side page of the upstream location catalog.
    pub async fn run_locations_page(&self, job: &LocationsPageJob) -> Result<JobCounts> {
        let page = self
            .api
            .list_locations(self.country_id, job.page, LOCATION_PAGE_SIZE)
            .await
            .context("failed to fetch locations page")?;

        let Some(page) = page else {
            info!(page = job.page, "No data returned for locations page");
            return Ok(JobCounts::default());
        };
        if page.results.is_empty() {
            info!(page = job.page, "Empty locations page");
            return Ok(JobCounts::default());
        }

        // Remember the upstream total so the next location refresh derives
        // its page count from observed reality instead of the fallback.
        if let Some(found) = &page.meta.found {
            if let Err(e) = kv::set_u64(&self.pool, KV_LOCATION_TOTAL, found.lower_bound()).await {
                warn!(error = ?e, "Failed to persist observed location total");
            }
        }

        let mut counts = JobCounts::default();
        for loc in &page.results {
            match self.process_location(loc, job.fetch_history).await {
                Ok(recorded) => {
                    counts.locations_processed += 1;
                    counts.measurements_recorded += recorded;
                }
                Err(e) => {
                    error!(location_id = loc.id, error = ?e, "Failed to process location");
                }
            }
        }

        info!(
            page = job.page,
            locations_processed = counts.locations_processed,
            total_on_page = page.results.len(),
            measurements_recorded = counts.measurements_recorded,
            "Locations page completed"
        );
        Ok(counts)
    }

    /// Refresh latest readings for one offset-based slice of local locations.
    pub async fn run_measurement_batch(&self, job: &MeasurementBatchJob) -> Result<JobCounts> {
        let batch = locations::page(&self.pool, job.offset, job.batch_size).await?;
        if batch.is_empty() {
            info!(offset = job.offset, "No more locations at offset");
            return Ok(JobCounts::default());
        }

        let mut counts = JobCounts::default();
        for location in &batch {
            counts.locations_processed += 1;
            match self.refresh_location_latest(location).await {
                Ok(recorded) => counts.measurements_recorded += recorded,
                Err(e) => {
                    error!(
                        location_id = location.id,
                        openaq_id = location.openaq_id,
                        error = ?e,
                        "Failed to refresh latest readings for location"
                    );
                }
            }
        }

        info!(
            offset = job.offset,
            batch_size = job.batch_size,
            locations_processed = counts.locations_processed,
            measurements_recorded = counts.measurements_recorded,
            "Measurement batch completed"
        );
        Ok(counts)
    }

    /// Upsert one location with its sensors and record its latest readings.
    /// Returns the number of new measurement rows.
    async fn process_location(&self, loc: &LocationData, fetch_history: bool) -> Result<u32> {
        let location = locations::upsert(&self.pool, loc).await?;

        // Parameters and sensors must exist before their measurements.
        let mut sensor_map: HashMap<i64, Sensor> = HashMap::new();
        for sensor_data in &loc.sensors {
            match self.upsert_sensor(&location, sensor_data).await {
                Ok(sensor) => {
                    sensor_map.insert(sensor_data.id, sensor);
                }
                Err(e) => {
                    warn!(
                        sensor_openaq_id = sensor_data.id,
                        error = ?e,
                        "Failed to upsert sensor"
                    );
                }
            }
        }

        let latest = self
            .api
            .latest_for_location(loc.id)
            .await
            .context("failed to fetch latest readings")?;

        let mut recorded = self.record_readings(&latest, &sensor_map).await;

        if fetch_history {
            recorded += self.backfill_history(loc, &sensor_map).await;
        }

        Ok(recorded)
    }

    async fn upsert_sensor(&self, location: &Location, sensor_data: &SensorData) -> Result<Sensor> {
        let parameter = parameters::upsert(&self.pool, &sensor_data.parameter).await?;
        sensors::upsert(&self.pool, sensor_data.id, location.id, parameter.id).await
    }

    /// Fetch and record latest readings for an already-mirrored location.
    async fn refresh_location_latest(&self, location: &Location) -> Result<u32> {
        let latest = self
            .api
            .latest_for_location(location.openaq_id)
            .await
            .context("failed to fetch latest readings")?;
        if latest.is_empty() {
            debug!(location_id = location.id, "No latest readings for location");
            return Ok(0);
        }

        let known = sensors::by_location(&self.pool, location.id).await?;
        let sensor_map: HashMap<i64, Sensor> =
            known.into_iter().map(|s| (s.openaq_id, s)).collect();

        Ok(self.record_readings(&latest, &sensor_map).await)
    }

    /// Route raw readings through the recorder via their sensor ids. Errors
    /// are isolated per reading.
    async fn record_readings(
        &self,
        readings: &[RawMeasurement],
        sensor_map: &HashMap<i64, Sensor>,
    ) -> u32 {
        let mut recorded = 0;
        for raw in readings {
            let Some(sensors_id) = raw.sensors_id else {
                debug!("Reading carries no sensor id, skipping");
                continue;
            };
            let Some(sensor) = sensor_map.get(&sensors_id) else {
                debug!(sensor_openaq_id = sensors_id, "Sensor not known for location");
                continue;
            };
            match measurements::record(&self.pool, sensor, raw).await {
                Ok(RecordOutcome::Inserted) => recorded += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(
                        sensor_openaq_id = sensors_id,
                        error = ?e,
                        "Failed to record measurement"
                    );
                }
            }
        }
        recorded
    }

    /// Pull recent history per (location, parameter) pair and record it.
    /// History readings carry the measurement payload shape; readings
    /// without a sensor id fall back to the parameter's sensor.
    async fn backfill_history(
        &self,
        loc: &LocationData,
        sensor_map: &HashMap<i64, Sensor>,
    ) -> u32 {
        let date_from = Utc::now() - ChronoDuration::days(HISTORY_BACKFILL_DAYS);
        let mut recorded = 0;

        for sensor_data in &loc.sensors {
            let Some(sensor) = sensor_map.get(&sensor_data.id) else {
                continue;
            };
            let history = match self
                .api
                .location_measurements(loc.id, &sensor_data.parameter.name, date_from)
                .await
            {
                Ok(history) => history,
                Err(e) => {
                    warn!(
                        location_id = loc.id,
                        parameter = %sensor_data.parameter.name,
                        error = ?e,
                        "Failed to fetch measurement history"
                    );
                    continue;
                }
            };

            for raw in &history {
                let target = raw
                    .sensors_id
                    .and_then(|id| sensor_map.get(&id))
                    .unwrap_or(sensor);
                match measurements::record(&self.pool, target, raw).await {
                    Ok(RecordOutcome::Inserted) => recorded += 1,
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            sensor_openaq_id = target.openaq_id,
                            error = ?e,
                            "Failed to record historical measurement"
                        );
                    }
                }
            }
        }
        recorded
    }
}
