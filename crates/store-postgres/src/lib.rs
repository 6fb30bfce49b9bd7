//! Postgres implementation of `jobagent_core::repository::Repository`.
//!
//! The atomic claim primitive is a CTE that selects the oldest eligible row
//! with `FOR UPDATE SKIP LOCKED`, then an `UPDATE ... WHERE id IN (...)`
//! transitions it in the same statement. Stale-lease recovery for jobs
//! whose host crashed mid-run is left to an external reconciler, so the
//! `WHERE` clause here only ever matches `status = 'pending'`.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use jobagent_core::error::RepositoryError;
use jobagent_core::host::Host;
use jobagent_core::job::{Job, JobEvent, JobStatus};
use jobagent_core::repository::Repository;

/// Connection pool wrapper implementing [`Repository`] over Postgres.
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    /// Connect with sane pool defaults for a long-running agent (small pool,
    /// short acquire timeout so a saturated DB surfaces as a transient error
    /// rather than hanging the supervisor tick).
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("failed to connect to job repository")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the crate's bundled migrations. Intended for agent setup and for
    /// test harnesses spinning up a fresh container.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run repository migrations")
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    uuid: String,
    job_type: String,
    status: String,
    created: chrono::DateTime<chrono::Utc>,
    started: Option<chrono::DateTime<chrono::Utc>>,
    finished: Option<chrono::DateTime<chrono::Utc>>,
    hostname: Option<String>,
    timeout: Option<i64>,
    ttl: i32,
    completion: i16,
    status_text: String,
    details: String,
    history: sqlx::types::Json<Vec<JobEvent>>,
    payload: serde_json::Value,
}

const JOB_COLUMNS: &str = "id, uuid, job_type, status::text AS status, created, started, \
    finished, hostname, timeout, ttl, completion, status_text, details, history, payload";

fn row_to_job(row: JobRow) -> Result<Job, RepositoryError> {
    let status = parse_status(&row.status)?;
    Ok(Job {
        id: Some(row.id),
        uuid: row.uuid,
        job_type: row.job_type,
        status,
        created: row.created,
        started: row.started,
        finished: row.finished,
        hostname: row.hostname,
        timeout: row.timeout,
        ttl: row.ttl,
        completion: row.completion.clamp(0, 100) as u8,
        status_text: row.status_text,
        details: row.details,
        history: row.history.0,
        payload: row.payload,
    })
}

fn parse_status(s: &str) -> Result<JobStatus, RepositoryError> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "success" => Ok(JobStatus::Success),
        "error" => Ok(JobStatus::Error),
        other => Err(RepositoryError::Permanent(anyhow!(
            "unrecognized job status in database: {other}"
        ))),
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Success => "success",
        JobStatus::Error => "error",
    }
}

/// Connectivity/pool-exhaustion errors are retried next tick; anything else
/// (constraint violation, missing row, bad enum label) is treated as
/// permanent.
fn classify(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Transient(err.into())
        }
        _ => RepositoryError::Permanent(err.into()),
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn claim_one(
        &self,
        eligible_types: &BTreeSet<String>,
        claimer: &str,
    ) -> Result<Option<Job>, RepositoryError> {
        // An empty type set returns nothing immediately rather than issuing
        // a query that would match no row anyway.
        if eligible_types.is_empty() {
            return Ok(None);
        }
        let types: Vec<String> = eligible_types.iter().cloned().collect();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH next_job AS (
                SELECT id FROM jobs
                WHERE status = 'pending' AND job_type = ANY($1)
                ORDER BY created ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running', hostname = $2, started = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&types)
        .bind(claimer)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(row_to_job).transpose()
    }

    async fn reload(&self, job: &Job) -> Result<Job, RepositoryError> {
        let id = job
            .id
            .ok_or_else(|| RepositoryError::Permanent(anyhow!("cannot reload a job with no id")))?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        row_to_job(row)
    }

    async fn save(&self, job: &Job) -> Result<(), RepositoryError> {
        let id = job
            .id
            .ok_or_else(|| RepositoryError::Permanent(anyhow!("cannot save a job with no id")))?;

        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2::job_status,
                started = $3,
                finished = $4,
                hostname = $5,
                timeout = $6,
                ttl = $7,
                completion = $8,
                status_text = $9,
                details = $10,
                history = $11,
                payload = $12
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status_str(job.status))
        .bind(job.started)
        .bind(job.finished)
        .bind(&job.hostname)
        .bind(job.timeout)
        .bind(job.ttl)
        .bind(job.completion as i16)
        .bind(&job.status_text)
        .bind(&job.details)
        .bind(sqlx::types::Json(&job.history))
        .bind(&job.payload)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn insert(&self, job: &Job) -> Result<Job, RepositoryError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (
                uuid, job_type, status, created, started, finished, hostname,
                timeout, ttl, completion, status_text, details, history, payload
            )
            VALUES ($1, $2, $3::job_status, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&job.uuid)
        .bind(&job.job_type)
        .bind(status_str(job.status))
        .bind(job.created)
        .bind(job.started)
        .bind(job.finished)
        .bind(&job.hostname)
        .bind(job.timeout)
        .bind(job.ttl)
        .bind(job.completion as i16)
        .bind(&job.status_text)
        .bind(&job.details)
        .bind(sqlx::types::Json(&job.history))
        .bind(&job.payload)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        row_to_job(row)
    }

    async fn save_host(&self, host: &Host) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO hosts (
                hostname, job_slots, last_status_time, status_index,
                system_snapshot, in_flight_by_type
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (hostname) DO UPDATE SET
                job_slots = EXCLUDED.job_slots,
                last_status_time = EXCLUDED.last_status_time,
                status_index = EXCLUDED.status_index,
                system_snapshot = EXCLUDED.system_snapshot,
                in_flight_by_type = EXCLUDED.in_flight_by_type
            "#,
        )
        .bind(&host.hostname)
        .bind(sqlx::types::Json(&host.job_slots))
        .bind(host.last_status_time)
        .bind(host.status_index as i64)
        .bind(sqlx::types::Json(&host.status_payload))
        .bind(sqlx::types::Json(&host.in_flight_by_type))
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_string_form() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Error,
        ] {
            assert_eq!(parse_status(status_str(status)).unwrap(), status);
        }
    }

    #[test]
    fn parse_status_rejects_unknown_labels() {
        assert!(parse_status("retrying").is_err());
    }
}
