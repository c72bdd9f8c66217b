//! The `sync_jobs` queue and the `sync_job_results` audit log.
//!
//! Workers lock jobs with `FOR UPDATE SKIP LOCKED` so any number of them can
//! poll concurrently without conflicts. Completed and exhausted jobs are
//! deleted; every run leaves an audit row for operator visibility.

use crate::data::models::SyncJob;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

const COLUMNS: &str = "id, kind, payload, retry_count, max_retries, locked_at, execute_at, queued_at";

/// A job ready to be enqueued.
#[derive(Debug)]
pub struct NewJob {
    pub kind: &'static str,
    pub payload: serde_json::Value,
    pub max_retries: i32,
}

/// Per-run audit record written to `sync_job_results`.
#[derive(Debug)]
pub struct JobReport<'a> {
    pub kind: &'a str,
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i32,
    pub success: bool,
    pub error: Option<&'a str>,
    pub retry_count: i32,
    pub locations_processed: Option<i32>,
    pub measurements_recorded: Option<i32>,
}

/// Enqueue a batch of jobs in one statement.
pub async fn enqueue_many(pool: &PgPool, jobs: &[NewJob]) -> Result<u64> {
    if jobs.is_empty() {
        return Ok(0);
    }

    let kinds: Vec<&str> = jobs.iter().map(|j| j.kind).collect();
    let payloads: Vec<serde_json::Value> = jobs.iter().map(|j| j.payload.clone()).collect();
    let max_retries: Vec<i32> = jobs.iter().map(|j| j.max_retries).collect();

    let result = sqlx::query(
        r#"
        INSERT INTO sync_jobs (kind, payload, max_retries)
        SELECT * FROM UNNEST($1::text[], $2::jsonb[], $3::int[])
        "#,
    )
    .bind(&kinds)
    .bind(&payloads)
    .bind(&max_retries)
    .execute(pool)
    .await
    .context("failed to enqueue jobs")?;

    Ok(result.rows_affected())
}

/// Payloads of jobs still pending for a kind, used by the orchestrator to
/// avoid enqueueing duplicates.
pub async fn pending_payloads(pool: &PgPool, kind: &str) -> Result<Vec<serde_json::Value>> {
    sqlx::query_scalar::<_, serde_json::Value>("SELECT payload FROM sync_jobs WHERE kind = $1")
        .bind(kind)
        .fetch_all(pool)
        .await
        .context("failed to fetch pending job payloads")
}

/// Atomically lock the next ready job for processing, or `None` when the
/// queue is empty.
pub async fn lock_next(pool: &PgPool) -> Result<Option<SyncJob>> {
    sqlx::query_as::<_, SyncJob>(&format!(
        r#"
        UPDATE sync_jobs
        SET locked_at = now()
        WHERE id = (
            SELECT id FROM sync_jobs
            WHERE locked_at IS NULL AND execute_at <= now()
            ORDER BY queued_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {COLUMNS}
        "#
    ))
    .fetch_optional(pool)
    .await
    .context("failed to lock next job")
}

/// Release a lock without consuming a retry (shutdown mid-processing).
pub async fn unlock(pool: &PgPool, id: i32) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET locked_at = NULL WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to unlock job")?;
    Ok(())
}

/// Delete a successfully completed job.
pub async fn complete(pool: &PgPool, id: i32) -> Result<()> {
    delete(pool, id).await
}

/// Unlock a failed job for a later retry attempt.
pub async fn retry(
    pool: &PgPool,
    id: i32,
    retry_count: i32,
    execute_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_jobs SET locked_at = NULL, retry_count = $2, execute_at = $3 WHERE id = $1",
    )
    .bind(id)
    .bind(retry_count)
    .bind(execute_at)
    .execute(pool)
    .await
    .context("failed to unlock job for retry")?;
    Ok(())
}

/// Delete a job (completed, exhausted, or corrupt).
pub async fn delete(pool: &PgPool, id: i32) -> Result<()> {
    sqlx::query("DELETE FROM sync_jobs WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete job")?;
    Ok(())
}

/// Record the outcome of one job run.
pub async fn insert_result(pool: &PgPool, report: &JobReport<'_>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_job_results
            (kind, payload, queued_at, started_at, duration_ms, success, error,
             retry_count, locations_processed, measurements_recorded)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(report.kind)
    .bind(&report.payload)
    .bind(report.queued_at)
    .bind(report.started_at)
    .bind(report.duration_ms)
    .bind(report.success)
    .bind(report.error)
    .bind(report.retry_count)
    .bind(report.locations_processed)
    .bind(report.measurements_recorded)
    .execute(pool)
    .await
    .context("failed to insert job result")?;
    Ok(())
}
