//! Store for `public.job_applications`, the canonical application table the
//! transfer stage materializes rows into.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;

const APPLICATIONS_TABLE: &str = "public.job_applications";

#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// One application row ready to insert. Decrypted inside the transfer stage,
/// never persisted in plaintext anywhere else.
#[derive(Debug, Clone)]
pub struct ApplicationInsert {
    pub user_uid: String,
    pub provider_source: String,
    pub provider_message_id: String,
    pub app_stage: Option<String>,
    pub stage_confidence: Option<i32>,
    pub app_stage_secondary: Option<String>,
    pub stage_confidence_secondary: Option<i32>,
    pub needs_review: bool,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ApplicationStore {
    pool: PgPool,
}

impl ApplicationStore {
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a batch of application rows. The conflict target is the natural
    /// key, so replaying a transfer batch inserts each message at most once.
    /// Returns how many rows were actually inserted.
    pub async fn insert_batch(&self, rows: &[ApplicationInsert]) -> Result<u64, ApplicationError> {
        let base_query = format!(
            r#"
INSERT INTO {}
    (user_uid, provider_source, provider_message_id,
     app_stage, stage_confidence, app_stage_secondary, stage_confidence_secondary,
     needs_review, received_at, updated_at, is_archived, is_deleted)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), FALSE, FALSE)
ON CONFLICT (provider_message_id) DO NOTHING
            "#,
            APPLICATIONS_TABLE
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| ApplicationError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let mut inserted = 0;
        for row in rows {
            let result = sqlx::query(&base_query)
                .bind(&row.user_uid)
                .bind(&row.provider_source)
                .bind(&row.provider_message_id)
                .bind(&row.app_stage)
                .bind(row.stage_confidence)
                .bind(&row.app_stage_secondary)
                .bind(row.stage_confidence_secondary)
                .bind(row.needs_review)
                .bind(row.received_at)
                .execute(&mut *tx)
                .await
                .map_err(|error| ApplicationError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                })?;
            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|error| ApplicationError::QueryError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(inserted)
    }
}
