//! Queue workers: poll `sync_jobs`, execute units of ingestion work, and
//! drive the per-job retry policy.

use crate::data::models::SyncJob;
use crate::data::sync_jobs;
use crate::data::sync_jobs::JobReport;
use crate::ingest::jobs::{JobError, JobKind, RETRY_DELAY};
use crate::ingest::pipeline::{Ingestor, JobCounts};
use crate::utils::fmt_duration;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{Instrument, debug, error, info, trace, warn};

/// Hard limit: a job running longer than this is aborted and, if retries
/// remain, restarted from scratch. Safe because every write is idempotent.
const JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Soft limit: exceeded runs complete but are flagged for operators.
const JOB_SOFT_TIMEOUT: Duration = Duration::from_secs(25 * 60);

/// A single worker instance.
///
/// Each worker runs in its own asynchronous task and continuously polls the
/// queue for ingestion jobs to execute.
pub struct Worker {
    id: usize,
    pool: PgPool,
    ingestor: Arc<Ingestor>,
}

impl Worker {
    pub fn new(id: usize, pool: PgPool, ingestor: Arc<Ingestor>) -> Self {
        Self { id, pool, ingestor }
    }

    /// Runs the worker's main loop.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(worker_id = self.id, "Worker started");

        loop {
            // Fetch and lock a job, racing against the shutdown signal.
            let job = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(worker_id = self.id, "Worker received shutdown signal, exiting gracefully");
                    break;
                }
                result = sync_jobs::lock_next(&self.pool) => {
                    match result {
                        Ok(Some(job)) => job,
                        Ok(None) => {
                            trace!(worker_id = self.id, "No jobs available, waiting");
                            time::sleep(Duration::from_secs(5)).await;
                            continue;
                        }
                        Err(e) => {
                            warn!(worker_id = self.id, error = ?e, "Failed to fetch job, waiting");
                            time::sleep(Duration::from_secs(10)).await;
                            continue;
                        }
                    }
                }
            };

            let job_id = job.id;
            let started_at = Utc::now();
            let start = std::time::Instant::now();

            // Process the job, racing against shutdown and the hard limit.
            let process_result = tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.handle_shutdown_during_processing(job_id).await;
                    break;
                }
                result = async {
                    match time::timeout(JOB_TIMEOUT, self.process_job(&job)).await {
                        Ok(result) => result,
                        Err(_elapsed) => Err(JobError::Recoverable(anyhow::anyhow!(
                            "job timed out after {}s",
                            JOB_TIMEOUT.as_secs()
                        ))),
                    }
                } => result
            };

            let duration = start.elapsed();
            self.handle_job_result(&job, process_result, duration, started_at)
                .await;
        }
    }

    async fn process_job(&self, job: &SyncJob) -> Result<JobCounts, JobError> {
        // Decode failures are unrecoverable: a corrupt payload cannot
        // succeed on retry.
        let kind = JobKind::decode(&job.kind, job.payload.clone())
            .map_err(JobError::Unrecoverable)?;

        let span = tracing::info_span!("process_job", job_id = job.id);
        async move {
            debug!(worker_id = self.id, "Processing job");

            // Upstream and database failures are recoverable.
            match kind {
                JobKind::LocationsPage(ref page_job) => {
                    self.ingestor.run_locations_page(page_job).await
                }
                JobKind::MeasurementBatch(ref batch_job) => {
                    self.ingestor.run_measurement_batch(batch_job).await
                }
            }
            .map_err(JobError::Recoverable)
        }
        .instrument(span)
        .await
    }

    /// Handle a shutdown signal received during job processing: release the
    /// lock so another worker can pick the job up.
    async fn handle_shutdown_during_processing(&self, job_id: i32) {
        info!(
            worker_id = self.id,
            job_id, "Shutdown received during job processing"
        );

        if let Err(e) = sync_jobs::unlock(&self.pool, job_id).await {
            warn!(
                worker_id = self.id,
                job_id,
                error = ?e,
                "Failed to unlock job during shutdown"
            );
        } else {
            debug!(worker_id = self.id, job_id, "Job unlocked during shutdown");
        }

        info!(worker_id = self.id, "Worker exiting gracefully");
    }

    async fn handle_job_result(
        &self,
        job: &SyncJob,
        result: Result<JobCounts, JobError>,
        duration: Duration,
        started_at: chrono::DateTime<Utc>,
    ) {
        let duration_ms = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);

        if duration > JOB_SOFT_TIMEOUT {
            warn!(
                worker_id = self.id,
                job_id = job.id,
                duration = fmt_duration(duration),
                "Job exceeded soft time limit (likely rate limiting or upstream delays)"
            );
        }

        match result {
            Ok(counts) => {
                if counts.measurements_recorded > 0 {
                    info!(
                        worker_id = self.id,
                        job_id = job.id,
                        duration = fmt_duration(duration),
                        locations_processed = counts.locations_processed,
                        measurements_recorded = counts.measurements_recorded,
                        "Job completed with new data"
                    );
                } else {
                    debug!(
                        worker_id = self.id,
                        job_id = job.id,
                        duration = fmt_duration(duration),
                        locations_processed = counts.locations_processed,
                        "Job completed (no new data)"
                    );
                }

                let report = JobReport {
                    kind: &job.kind,
                    payload: job.payload.clone(),
                    queued_at: job.queued_at,
                    started_at,
                    duration_ms,
                    success: true,
                    error: None,
                    retry_count: job.retry_count,
                    locations_processed: Some(counts.locations_processed as i32),
                    measurements_recorded: Some(counts.measurements_recorded as i32),
                };
                if let Err(e) = sync_jobs::insert_result(&self.pool, &report).await {
                    error!(worker_id = self.id, job_id = job.id, error = ?e, "Failed to insert job result");
                }

                if let Err(e) = sync_jobs::complete(&self.pool, job.id).await {
                    error!(worker_id = self.id, job_id = job.id, error = ?e, "Failed to complete job");
                }
            }
            Err(JobError::Recoverable(e)) => {
                self.handle_recoverable_error(job, e, duration, started_at)
                    .await;
            }
            Err(JobError::Unrecoverable(e)) => {
                let err_msg = format!("{e:#}");
                let report = JobReport {
                    kind: &job.kind,
                    payload: job.payload.clone(),
                    queued_at: job.queued_at,
                    started_at,
                    duration_ms,
                    success: false,
                    error: Some(&err_msg),
                    retry_count: job.retry_count,
                    locations_processed: None,
                    measurements_recorded: None,
                };
                if let Err(log_err) = sync_jobs::insert_result(&self.pool, &report).await {
                    error!(worker_id = self.id, job_id = job.id, error = ?log_err, "Failed to insert job result");
                }

                error!(
                    worker_id = self.id,
                    job_id = job.id,
                    duration = fmt_duration(duration),
                    error = ?e,
                    "Job corrupted, deleting"
                );
                if let Err(e) = sync_jobs::delete(&self.pool, job.id).await {
                    error!(worker_id = self.id, job_id = job.id, error = ?e, "Failed to delete corrupted job");
                }
            }
        }
    }

    /// Retry a recoverably failed job after the fixed delay, or exhaust it
    /// once the retry budget is spent.
    async fn handle_recoverable_error(
        &self,
        job: &SyncJob,
        e: anyhow::Error,
        duration: Duration,
        started_at: chrono::DateTime<Utc>,
    ) {
        let next_attempt = job.retry_count.saturating_add(1);
        let remaining_retries = job.max_retries.saturating_sub(next_attempt);

        error!(
            worker_id = self.id,
            job_id = job.id,
            duration = fmt_duration(duration),
            retry_attempt = next_attempt,
            max_retries = job.max_retries,
            remaining_retries,
            error = ?e,
            "Failed to process job"
        );

        if next_attempt <= job.max_retries {
            let execute_at = Utc::now()
                + chrono::Duration::from_std(RETRY_DELAY).unwrap_or(chrono::Duration::zero());
            match sync_jobs::retry(&self.pool, job.id, next_attempt, execute_at).await {
                Ok(()) => {
                    debug!(
                        worker_id = self.id,
                        job_id = job.id,
                        retry_attempt = next_attempt,
                        remaining_retries,
                        "Job unlocked for retry"
                    );
                }
                Err(e) => {
                    error!(worker_id = self.id, job_id = job.id, error = ?e, "Failed to unlock job for retry");
                }
            }
        } else {
            let duration_ms = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
            let err_msg = format!("{e:#}");
            let report = JobReport {
                kind: &job.kind,
                payload: job.payload.clone(),
                queued_at: job.queued_at,
                started_at,
                duration_ms,
                success: false,
                error: Some(&err_msg),
                retry_count: next_attempt,
                locations_processed: None,
                measurements_recorded: None,
            };
            if let Err(log_err) = sync_jobs::insert_result(&self.pool, &report).await {
                error!(worker_id = self.id, job_id = job.id, error = ?log_err, "Failed to insert job result");
            }

            error!(
                worker_id = self.id,
                job_id = job.id,
                duration = fmt_duration(duration),
                retry_count = next_attempt,
                max_retries = job.max_retries,
                error = ?e,
                "Job failed permanently (max retries exceeded), deleting"
            );
            if let Err(e) = sync_jobs::delete(&self.pool, job.id).await {
                error!(worker_id = self.id, job_id = job.id, error = ?e, "Failed to delete exhausted job");
            }
        }
    }
}
