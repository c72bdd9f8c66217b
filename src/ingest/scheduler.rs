//! Periodic trigger layer: decides when to run the orchestrators, nothing
//! more. Trigger timestamps persist in `app_kv` so restarts respect the
//! remaining cooldown instead of redoing recent work.

use crate::config::Config;
use crate::ingest::orchestrator;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

/// How often latest readings are refreshed (2 hours).
const MEASUREMENT_REFRESH_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// How often the full location catalog is re-fetched (weekly).
const LOCATION_REFRESH_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// app_kv keys for persisting trigger timestamps across restarts.
pub const KV_MEASUREMENT_REFRESH: &str = "scheduler.measurement_refresh";
pub const KV_LOCATION_REFRESH: &str = "scheduler.location_refresh";

/// The trigger table: task -> interval. Built from config overrides and
/// validated up front so a bad override fails at startup, not silently at
/// trigger time.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub measurement_refresh: Duration,
    pub location_refresh: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            measurement_refresh: MEASUREMENT_REFRESH_INTERVAL,
            location_refresh: LOCATION_REFRESH_INTERVAL,
        }
    }
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            measurement_refresh: config
                .measurement_refresh_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.measurement_refresh),
            location_refresh: config
                .location_refresh_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.location_refresh),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.measurement_refresh.is_zero() || self.location_refresh.is_zero() {
            anyhow::bail!("schedule intervals must be non-zero");
        }
        if self.location_refresh < self.measurement_refresh {
            anyhow::bail!("location refresh must not be more frequent than measurement refresh");
        }
        Ok(())
    }
}

/// Convert a persisted UTC timestamp to an `Instant`, preserving remaining
/// cooldown.
///
/// If the persisted time is older than `interval`, returns an `Instant` that
/// triggers immediate execution. If it's recent, the returned `Instant`
/// reflects how much time has actually elapsed so the remaining cooldown is
/// respected.
fn persisted_to_instant(persisted: Option<DateTime<Utc>>, interval: Duration) -> Instant {
    match persisted {
        None => Instant::now() - interval,
        Some(ts) => {
            let elapsed = (Utc::now() - ts).to_std().unwrap_or(interval);
            if elapsed >= interval {
                Instant::now() - interval
            } else {
                Instant::now() - elapsed
            }
        }
    }
}

/// What a spawned trigger cycle accomplished.
#[derive(Debug, Clone, Copy, Default)]
struct TriggerOutcome {
    measurements_refreshed: bool,
    locations_refreshed: bool,
}

/// In-memory trigger timestamps. These only advance for triggers that
/// actually enqueued work, so a failed trigger is retried on the next wake
/// instead of waiting out a full interval.
#[derive(Debug)]
struct TriggerState {
    last_measurement_refresh: Instant,
    last_location_refresh: Instant,
}

impl TriggerState {
    fn new(
        persisted_measurement: Option<DateTime<Utc>>,
        persisted_location: Option<DateTime<Utc>>,
        schedule: &Schedule,
    ) -> Self {
        Self {
            last_measurement_refresh: persisted_to_instant(
                persisted_measurement,
                schedule.measurement_refresh,
            ),
            last_location_refresh: persisted_to_instant(
                persisted_location,
                schedule.location_refresh,
            ),
        }
    }

    /// Which triggers are due: (measurements, locations).
    fn due(&self, schedule: &Schedule) -> (bool, bool) {
        (
            self.last_measurement_refresh.elapsed() >= schedule.measurement_refresh,
            self.last_location_refresh.elapsed() >= schedule.location_refresh,
        )
    }

    fn apply(&mut self, outcome: TriggerOutcome) {
        if outcome.measurements_refreshed {
            self.last_measurement_refresh = Instant::now();
        }
        if outcome.locations_refreshed {
            self.last_location_refresh = Instant::now();
        }
    }
}

/// Periodically triggers the batch orchestrators.
pub struct Scheduler {
    pool: PgPool,
    schedule: Schedule,
    fetch_history: bool,
}

impl Scheduler {
    pub fn new(pool: PgPool, schedule: Schedule, fetch_history: bool) -> Self {
        Self {
            pool,
            schedule,
            fetch_history,
        }
    }

    /// Runs the scheduler's main loop with graceful shutdown support.
    ///
    /// Wakes every 60 seconds, compares elapsed time against the schedule
    /// table, and spawns trigger work in a cancellable task. A cycle is
    /// skipped while the previous one is still running.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            measurement_refresh = ?self.schedule.measurement_refresh,
            location_refresh = ?self.schedule.location_refresh,
            "Scheduler service started"
        );

        let work_interval = Duration::from_secs(60);
        let mut next_run = time::Instant::now();
        let mut current_work: Option<(tokio::task::JoinHandle<TriggerOutcome>, CancellationToken)> =
            None;

        // Load persisted timestamps so we don't redo work that completed
        // recently.
        let persisted_measurement = crate::data::kv::get_timestamp(&self.pool, KV_MEASUREMENT_REFRESH)
            .await
            .unwrap_or(None);
        let persisted_location = crate::data::kv::get_timestamp(&self.pool, KV_LOCATION_REFRESH)
            .await
            .unwrap_or(None);

        if persisted_measurement.is_some() || persisted_location.is_some() {
            info!(
                last_measurement_refresh = ?persisted_measurement,
                last_location_refresh = ?persisted_location,
                "Loaded persisted scheduler timestamps"
            );
        }

        let mut state =
            TriggerState::new(persisted_measurement, persisted_location, &self.schedule);

        loop {
            tokio::select! {
                _ = time::sleep_until(next_run) => {
                    // Harvest the previous cycle's outcome, or skip if it is
                    // still running.
                    if let Some((handle, cancel_token)) = current_work.take() {
                        if !handle.is_finished() {
                            trace!("Previous trigger cycle still running, skipping");
                            current_work = Some((handle, cancel_token));
                            next_run = time::Instant::now() + work_interval;
                            continue;
                        }
                        match handle.await {
                            Ok(outcome) => state.apply(outcome),
                            Err(e) => warn!(error = ?e, "Trigger work panicked"),
                        }
                    }

                    let (should_refresh_measurements, should_refresh_locations) =
                        state.due(&self.schedule);

                    if !should_refresh_measurements && !should_refresh_locations {
                        next_run = time::Instant::now() + work_interval;
                        continue;
                    }

                    let cancel_token = CancellationToken::new();
                    let work_handle = tokio::spawn({
                        let pool = self.pool.clone();
                        let fetch_history = self.fetch_history;
                        let cancel_token = cancel_token.clone();

                        async move {
                            let work = async {
                                let mut outcome = TriggerOutcome::default();

                                if should_refresh_locations {
                                    match orchestrator::schedule_location_refresh(&pool, fetch_history).await {
                                        Ok(summary) => {
                                            info!(
                                                scheduled = summary.scheduled,
                                                skipped = summary.skipped,
                                                "Location refresh triggered"
                                            );
                                            outcome.locations_refreshed = true;
                                            if let Err(e) = crate::data::kv::set_timestamp(&pool, KV_LOCATION_REFRESH, Utc::now()).await {
                                                warn!(error = ?e, "Failed to persist location refresh timestamp");
                                            }
                                        }
                                        Err(e) => error!(error = ?e, "Failed to schedule location refresh"),
                                    }
                                }

                                if should_refresh_measurements {
                                    match orchestrator::schedule_measurement_refresh(&pool).await {
                                        Ok(summary) => {
                                            info!(
                                                scheduled = summary.scheduled,
                                                skipped = summary.skipped,
                                                "Measurement refresh triggered"
                                            );
                                            outcome.measurements_refreshed = true;
                                            if let Err(e) = crate::data::kv::set_timestamp(&pool, KV_MEASUREMENT_REFRESH, Utc::now()).await {
                                                warn!(error = ?e, "Failed to persist measurement refresh timestamp");
                                            }
                                        }
                                        Err(e) => error!(error = ?e, "Failed to schedule measurement refresh"),
                                    }
                                }

                                outcome
                            };

                            tokio::select! {
                                outcome = work => outcome,
                                _ = cancel_token.cancelled() => {
                                    trace!("Trigger work cancelled gracefully");
                                    TriggerOutcome::default()
                                }
                            }
                        }
                    });

                    current_work = Some((work_handle, cancel_token));
                    next_run = time::Instant::now() + work_interval;
                }
                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown signal");

                    if let Some((handle, cancel_token)) = current_work.take() {
                        cancel_token.cancel();

                        if time::timeout(Duration::from_secs(5), handle).await.is_err() {
                            warn!("Trigger work did not complete within 5s, abandoning");
                        } else {
                            trace!("Trigger work completed gracefully");
                        }
                    }

                    info!("Scheduler exiting gracefully");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_valid() {
        Schedule::default().validate().unwrap();
    }

    #[test]
    fn zero_interval_is_rejected() {
        let schedule = Schedule {
            measurement_refresh: Duration::ZERO,
            location_refresh: LOCATION_REFRESH_INTERVAL,
        };
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn inverted_intervals_are_rejected() {
        let schedule = Schedule {
            measurement_refresh: Duration::from_secs(7 * 24 * 60 * 60),
            location_refresh: Duration::from_secs(60),
        };
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn failed_trigger_stays_due() {
        let schedule = Schedule {
            measurement_refresh: Duration::from_secs(60),
            location_refresh: Duration::from_secs(60),
        };
        let mut state = TriggerState::new(None, None, &schedule);
        assert_eq!(state.due(&schedule), (true, true));

        // Nothing enqueued: both triggers must still be due on the next wake.
        state.apply(TriggerOutcome::default());
        assert_eq!(state.due(&schedule), (true, true));
    }

    #[test]
    fn successful_trigger_resets_cooldown() {
        let schedule = Schedule {
            measurement_refresh: Duration::from_secs(60),
            location_refresh: Duration::from_secs(60),
        };
        let mut state = TriggerState::new(None, None, &schedule);

        state.apply(TriggerOutcome {
            measurements_refreshed: true,
            locations_refreshed: false,
        });
        assert_eq!(state.due(&schedule), (false, true));
    }

    #[test]
    fn missing_timestamp_triggers_immediately() {
        let instant = persisted_to_instant(None, Duration::from_secs(3600));
        assert!(instant.elapsed() >= Duration::from_secs(3600));
    }

    #[test]
    fn recent_timestamp_preserves_cooldown() {
        let interval = Duration::from_secs(3600);
        let persisted = Some(Utc::now() - chrono::Duration::seconds(600));
        let instant = persisted_to_instant(persisted, interval);
        let elapsed = instant.elapsed();
        assert!(elapsed >= Duration::from_secs(599));
        assert!(elapsed < interval);
    }

    #[test]
    fn stale_timestamp_triggers_immediately() {
        let interval = Duration::from_secs(3600);
        let persisted = Some(Utc::now() - chrono::Duration::seconds(7200));
        let instant = persisted_to_instant(persisted, interval);
        assert!(instant.elapsed() >= interval);
    }
}
