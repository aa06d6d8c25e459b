//! Lookup of stored provider credentials. The OAuth flow that writes these
//! lives in a separate service; workers only ever read.

use sqlx::postgres::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

#[derive(Clone)]
pub struct AccountStore {
    pool: PgPool,
}

impl AccountStore {
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The user's encrypted refresh credential, if one is on file.
    /// `None` means the user revoked access (or never granted it) and any
    /// in-flight sync for them should abort silently.
    pub async fn get_refresh_token(&self, user_id: &str) -> Result<Option<String>, AccountError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT google_refresh_token FROM user_account WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| AccountError::QueryError {
                    command: "SELECT".to_owned(),
                    error,
                })?;

        Ok(row.and_then(|(token,)| token))
    }
}
