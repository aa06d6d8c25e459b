//! # PgQueue
//!
//! The pipeline's queue broker: a job queue implemented on top of a
//! PostgreSQL table. Every stage consumes one named queue and emits task
//! envelopes into downstream queues. A job carries its own attempt counter,
//! so broker-level redelivery and backoff live here; stage-level retry sets
//! are re-enqueued by the stages themselves as fresh jobs.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::PgPool;
use thiserror::Error;

/// Encode a countdown for an INTERVAL parameter.
fn pg_interval(duration: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: duration.num_microseconds().unwrap_or(i64::MAX),
    }
}

/// The table all queues share. Queues are distinguished by the `queue` column.
const JOBS_TABLE: &str = "job_queue";

/// Enumeration of errors for operations with PgQueue.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum PgQueueError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// Errors for transitions on an individual job.
#[derive(Error, Debug)]
pub enum PgJobError<T> {
    #[error("retry is an invalid state for this job: {error}")]
    RetryInvalidError { job: T, error: String },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// Enumeration of possible statuses for a Job.
#[derive(Debug, PartialEq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// A job that is waiting in the queue to be picked up by a worker.
    Available,
    /// A job that was successfully completed by a worker.
    Completed,
    /// A job that was unsuccessfully completed by a worker and won't be retried.
    Failed,
    /// A job that was picked up by a worker and is currently being run.
    Running,
}

/// Allow casting JobStatus from strings.
impl FromStr for JobStatus {
    type Err = PgQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "running" => Ok(JobStatus::Running),
            invalid => Err(PgQueueError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// JobParameters are stored and read to and from a JSONB field, so we accept anything that fits `sqlx::types::Json`.
pub type JobParameters<J> = sqlx::types::Json<J>;

/// A Job to be executed by a worker dequeueing a PgQueue.
#[derive(sqlx::FromRow, Debug)]
pub struct Job<J> {
    /// A unique id identifying a job.
    pub id: i64,
    /// A number corresponding to the current job attempt.
    pub attempt: i32,
    /// A datetime corresponding to when the job was attempted.
    pub attempted_at: DateTime<Utc>,
    /// A vector of identifiers that have attempted this job. E.g. thread ids, pod names, etc...
    pub attempted_by: Vec<String>,
    /// A datetime corresponding to when the job was created.
    pub created_at: DateTime<Utc>,
    /// The current job's number of max attempts.
    pub max_attempts: i32,
    /// Arbitrary job parameters stored as JSON.
    pub parameters: JobParameters<J>,
    /// The queue this job was dequeued from.
    pub queue: String,
    /// The current status of the job.
    pub status: JobStatus,
}

impl<J> Job<J> {
    /// Whether this job has any attempts left after the current one.
    pub fn is_retryable(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// A Job that has been dequeued and is owned by a worker until transitioned.
/// Only one of `complete`, `retry` or `fail` may be called; all consume the job.
pub struct PgJob<J> {
    pub job: Job<J>,
    pool: PgPool,
}

impl<J: Serialize + DeserializeOwned + Send + Sync> PgJob<J> {
    /// Mark this job as completed.
    pub async fn complete(self) -> Result<(), PgJobError<Self>> {
        let base_query = format!(
            r#"
UPDATE
    "{0}"
SET
    completed_at = NOW(),
    status = 'completed'::job_status
WHERE
    "{0}".id = $1
            "#,
            JOBS_TABLE
        );

        sqlx::query(&base_query)
            .bind(self.job.id)
            .execute(&self.pool)
            .await
            .map_err(|error| PgJobError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Schedule this job to run again after `interval`, recording `error`.
    /// Fails with `RetryInvalidError` when the job has exhausted its attempts.
    pub async fn retry(self, error: &str, interval: Duration) -> Result<(), PgJobError<Self>> {
        if !self.job.is_retryable() {
            let error = error.to_owned();
            return Err(PgJobError::RetryInvalidError {
                job: self,
                error: format!("job has reached max attempts: {}", error),
            });
        }

        let base_query = format!(
            r#"
UPDATE
    "{0}"
SET
    status = 'available'::job_status,
    scheduled_at = NOW() + $2,
    errors = array_append("{0}".errors, $3)
WHERE
    "{0}".id = $1
            "#,
            JOBS_TABLE
        );

        sqlx::query(&base_query)
            .bind(self.job.id)
            .bind(pg_interval(interval))
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|error| PgJobError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Mark this job as failed. Failed jobs remain in the table for tracking
    /// purposes but will not be dequeued again.
    pub async fn fail(self, error: &str) -> Result<(), PgJobError<Self>> {
        let base_query = format!(
            r#"
UPDATE
    "{0}"
SET
    completed_at = NOW(),
    status = 'failed'::job_status,
    errors = array_append("{0}".errors, $2)
WHERE
    "{0}".id = $1
            "#,
            JOBS_TABLE
        );

        sqlx::query(&base_query)
            .bind(self.job.id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|error| PgJobError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

/// A NewJob to be enqueued into a PgQueue.
pub struct NewJob<J> {
    /// The maximum amount of attempts this NewJob has to complete.
    pub max_attempts: i32,
    /// The JSON-serializable parameters for this NewJob.
    pub parameters: JobParameters<J>,
    /// An optional delay before the job becomes available for dequeueing.
    /// This carries the task envelope's `countdown`.
    pub countdown: Option<Duration>,
}

impl<J> NewJob<J> {
    pub fn new(max_attempts: i32, parameters: J) -> Self {
        Self {
            max_attempts,
            parameters: sqlx::types::Json(parameters),
            countdown: None,
        }
    }

    pub fn with_countdown(max_attempts: i32, parameters: J, countdown: Duration) -> Self {
        Self {
            max_attempts,
            parameters: sqlx::types::Json(parameters),
            countdown: Some(countdown),
        }
    }
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this PgQueue as multiple share a table.
    name: String,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, PgQueueError>;

impl PgQueue {
    /// Initialize a PgQueue on one of the shared table's queues.
    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dequeue the next available Job from this PgQueue, if any.
    ///
    /// The query uses a FOR UPDATE SKIP LOCKED clause so that concurrent
    /// workers never hand the same job to two consumers.
    pub async fn dequeue<J: DeserializeOwned + Send + Unpin + 'static>(
        &self,
        attempted_by: &str,
    ) -> PgQueueResult<Option<PgJob<J>>> {
        let base_query = format!(
            r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        "{0}"
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
        AND queue = $1
    ORDER BY
        scheduled_at, id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    "{0}"
SET
    attempted_at = NOW(),
    status = 'running'::job_status,
    attempt = "{0}".attempt + 1,
    attempted_by = array_append("{0}".attempted_by, $2::text)
FROM
    available_in_queue
WHERE
    "{0}".id = available_in_queue.id
RETURNING
    "{0}".*
            "#,
            JOBS_TABLE
        );

        let job: Option<Job<J>> = sqlx::query_as(&base_query)
            .bind(&self.name)
            .bind(attempted_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(job.map(|job| PgJob {
            job,
            pool: self.pool.clone(),
        }))
    }

    /// Enqueue a Job into this PgQueue.
    /// We take ownership of NewJob to enforce a specific NewJob is only enqueued once.
    pub async fn enqueue<J: Serialize + Sync>(&self, job: NewJob<J>) -> PgQueueResult<()> {
        let base_query = format!(
            r#"
INSERT INTO "{0}"
    (attempt, created_at, scheduled_at, max_attempts, parameters, queue, status)
VALUES
    (0, NOW(), NOW() + $1, $2, $3, $4, 'available'::job_status)
            "#,
            JOBS_TABLE
        );

        sqlx::query(&base_query)
            .bind(pg_interval(job.countdown.unwrap_or_else(Duration::zero)))
            .bind(job.max_attempts)
            .bind(&job.parameters)
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_from_str() {
        assert_eq!(JobStatus::from_str("available").unwrap(), JobStatus::Available);
        assert_eq!(JobStatus::from_str("completed").unwrap(), JobStatus::Completed);
        assert_eq!(JobStatus::from_str("failed").unwrap(), JobStatus::Failed);
        assert_eq!(JobStatus::from_str("running").unwrap(), JobStatus::Running);
        assert!(JobStatus::from_str("sleeping").is_err());
    }

    #[test]
    fn retryable_depends_on_remaining_attempts() {
        let job = Job {
            id: 1,
            attempt: 1,
            attempted_at: Utc::now(),
            attempted_by: vec!["worker-1".to_owned()],
            created_at: Utc::now(),
            max_attempts: 3,
            parameters: sqlx::types::Json("{}".to_owned()),
            queue: "relevance_model_queue".to_owned(),
            status: JobStatus::Running,
        };
        assert!(job.is_retryable());

        let exhausted = Job { attempt: 3, ..job };
        assert!(!exhausted.is_retryable());
    }
}
