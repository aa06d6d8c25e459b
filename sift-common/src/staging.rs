//! Store for `internal_staging.email_staging`, the durable staging table all
//! model stages read from and write status transitions to.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::tasks::{ApplicationStage, EmailStatus};

const STAGING_TABLE: &str = "internal_staging.email_staging";

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

pub type StagingResult<T> = Result<T, StagingError>;

/// A staging row as inserted by the content fetcher. Sensitive fields are
/// fernet tokens; `status` starts as `AWAIT_RELEVANCE`.
#[derive(Debug, Clone)]
pub struct NewStagingRow {
    pub id: Uuid,
    pub user_id_enc: String,
    pub trace_id: String,
    pub provider: String,
    pub provider_message_id: String,
    pub subject_enc: String,
    pub sender_enc: String,
    pub received_at_enc: String,
    pub body_enc: String,
}

/// The encrypted columns the model stages need.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ModelInputRow {
    pub id: Uuid,
    pub subject_enc: String,
    pub sender_enc: String,
    pub body_enc: String,
    pub provider_message_id: String,
}

/// A full staging row, as read by the transfer stage.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct StagingRow {
    pub id: Uuid,
    pub user_id_enc: String,
    pub trace_id: String,
    pub provider: String,
    pub provider_message_id: String,
    pub subject_enc: String,
    pub sender_enc: String,
    pub received_at_enc: String,
    pub body_enc: String,
    pub status: String,
    pub app_stage: Option<String>,
    pub app_stage_secondary: Option<String>,
    pub confidence_score: Option<i32>,
    pub confidence_score_secondary: Option<i32>,
    pub needs_review: Option<bool>,
}

/// Classification outputs written back onto one staging row.
#[derive(Debug, Clone)]
pub struct ClassificationUpdate {
    pub id: Uuid,
    pub stage: ApplicationStage,
    pub confidence: i32,
    pub stage_secondary: ApplicationStage,
    pub confidence_secondary: i32,
    pub needs_review: bool,
}

/// The buckets a relevance pass sorts a batch into, applied as one
/// transactional write.
#[derive(Debug, Default, Clone)]
pub struct RelevancePartition {
    pub relevant: Vec<Uuid>,
    pub purge: Vec<Uuid>,
    pub retry: Vec<Uuid>,
}

#[derive(Clone)]
pub struct StagingStore {
    pool: PgPool,
}

impl StagingStore {
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a batch of freshly fetched rows. Returns the ids actually
    /// inserted; duplicates of `provider_message_id` (replays, or the same id
    /// twice in one batch) are skipped by the conflict target, which is what
    /// makes fetch redelivery safe.
    pub async fn insert_batch(&self, rows: &[NewStagingRow]) -> StagingResult<Vec<Uuid>> {
        let base_query = format!(
            r#"
INSERT INTO {}
    (id, user_id_enc, trace_id, provider, provider_message_id,
     subject_enc, sender_enc, received_at_enc, body_enc, status)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (provider_message_id) DO NOTHING
RETURNING id
            "#,
            STAGING_TABLE
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StagingError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Option<(Uuid,)> = sqlx::query_as(&base_query)
                .bind(row.id)
                .bind(&row.user_id_enc)
                .bind(&row.trace_id)
                .bind(&row.provider)
                .bind(&row.provider_message_id)
                .bind(&row.subject_enc)
                .bind(&row.sender_enc)
                .bind(&row.received_at_enc)
                .bind(&row.body_enc)
                .bind(EmailStatus::AwaitRelevance.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| StagingError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                })?;

            if let Some((id,)) = id {
                inserted.push(id);
            }
        }

        tx.commit().await.map_err(|error| StagingError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(inserted)
    }

    /// Load the encrypted model inputs for a set of rows.
    pub async fn fetch_model_inputs(&self, ids: &[Uuid]) -> StagingResult<Vec<ModelInputRow>> {
        let base_query = format!(
            "SELECT id, subject_enc, sender_enc, body_enc, provider_message_id FROM {} WHERE id = ANY($1)",
            STAGING_TABLE
        );

        sqlx::query_as(&base_query)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StagingError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Load full rows, as needed by the transfer stage.
    pub async fn fetch_rows(&self, ids: &[Uuid]) -> StagingResult<Vec<StagingRow>> {
        let base_query = format!(
            r#"
SELECT
    id, user_id_enc, trace_id, provider, provider_message_id,
    subject_enc, sender_enc, received_at_enc, body_enc, status,
    app_stage, app_stage_secondary, confidence_score, confidence_score_secondary,
    needs_review
FROM {}
WHERE id = ANY($1)
            "#,
            STAGING_TABLE
        );

        sqlx::query_as(&base_query)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StagingError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Conditionally transition a set of rows: only rows currently in one of
    /// `expected` move to `to`. Returns the number of rows that moved.
    /// Status only ever advances through the DAG because every caller names
    /// the states it is allowed to consume.
    pub async fn update_status(
        &self,
        ids: &[Uuid],
        expected: &[EmailStatus],
        to: EmailStatus,
    ) -> StagingResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let base_query = format!(
            "UPDATE {} SET status = $1 WHERE id = ANY($2) AND status = ANY($3)",
            STAGING_TABLE
        );
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_owned()).collect();

        let result = sqlx::query(&base_query)
            .bind(to.as_str())
            .bind(ids)
            .bind(&expected)
            .execute(&self.pool)
            .await
            .map_err(|error| StagingError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// Terminal transition for rows whose stage retries are exhausted.
    pub async fn mark_failed_permanently(&self, ids: &[Uuid]) -> StagingResult<u64> {
        let base_query = format!(
            "UPDATE {} SET status = $1 WHERE id = ANY($2)",
            STAGING_TABLE
        );

        let result = sqlx::query(&base_query)
            .bind(EmailStatus::FailedPermanently.as_str())
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|error| StagingError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// Apply a relevance partition as one batched write.
    pub async fn apply_relevance(&self, partition: &RelevancePartition) -> StagingResult<()> {
        let base_query = format!(
            "UPDATE {} SET status = $1 WHERE id = ANY($2) AND status = ANY($3)",
            STAGING_TABLE
        );
        let admissible = vec![
            EmailStatus::AwaitRelevance.as_str().to_owned(),
            EmailStatus::Retry.as_str().to_owned(),
        ];

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StagingError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        for (ids, to) in [
            (&partition.relevant, EmailStatus::AwaitClassification),
            (&partition.purge, EmailStatus::Purge),
            (&partition.retry, EmailStatus::Retry),
        ] {
            if ids.is_empty() {
                continue;
            }
            sqlx::query(&base_query)
                .bind(to.as_str())
                .bind(ids)
                .bind(&admissible)
                .execute(&mut *tx)
                .await
                .map_err(|error| StagingError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
        }

        tx.commit().await.map_err(|error| StagingError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(())
    }

    /// Write classification outputs and advance rows to `AWAIT_TRANSFER`.
    pub async fn apply_classification(
        &self,
        updates: &[ClassificationUpdate],
    ) -> StagingResult<()> {
        let base_query = format!(
            r#"
UPDATE {}
SET
    app_stage = $1,
    confidence_score = $2,
    app_stage_secondary = $3,
    confidence_score_secondary = $4,
    needs_review = $5,
    status = $6
WHERE id = $7 AND status = ANY($8)
            "#,
            STAGING_TABLE
        );
        let admissible = vec![
            EmailStatus::AwaitClassification.as_str().to_owned(),
            EmailStatus::Retry.as_str().to_owned(),
        ];

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StagingError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        for update in updates {
            sqlx::query(&base_query)
                .bind(update.stage.as_str())
                .bind(update.confidence)
                .bind(update.stage_secondary.as_str())
                .bind(update.confidence_secondary)
                .bind(update.needs_review)
                .bind(EmailStatus::AwaitTransfer.as_str())
                .bind(update.id)
                .bind(&admissible)
                .execute(&mut *tx)
                .await
                .map_err(|error| StagingError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
        }

        tx.commit().await.map_err(|error| StagingError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(())
    }

    /// Rows that were classified but whose retry set is exhausted keep their
    /// partial outputs; only the status flips.
    pub async fn mark_retry(&self, ids: &[Uuid], expected: EmailStatus) -> StagingResult<u64> {
        self.update_status(ids, &[expected, EmailStatus::Retry], EmailStatus::Retry)
            .await
    }
}

/// Decode an encrypted `received_at` column (epoch milliseconds, as provided
/// by the mail provider's `internalDate`) into a timestamp.
pub fn parse_received_at(plaintext: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = plaintext.trim().parse().ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_received_at() {
        let parsed = parse_received_at("1706745600000").unwrap();
        assert_eq!(parsed.timestamp(), 1706745600);

        assert!(parse_received_at("").is_none());
        assert!(parse_received_at("next tuesday").is_none());
    }
}
