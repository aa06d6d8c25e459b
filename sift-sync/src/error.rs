use sift_common::accounts::AccountError;
use sift_common::crypto::CryptoError;
use sift_common::pgqueue::PgQueueError;
use sift_common::staging::StagingError;
use thiserror::Error;

/// Errors talking to the mail provider.
#[derive(Error, Debug)]
pub enum GmailError {
    #[error("provider request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("token exchange failed with status {status}")]
    TokenExchangeError { status: reqwest::StatusCode },
    #[error("token exchange response contained no access token")]
    MissingAccessTokenError,
    #[error("message list failed with status {status}")]
    ListError { status: reqwest::StatusCode },
    #[error("could not decode batch response: {0}")]
    BatchDecodeError(String),
}

/// Errors processing a dispatch or fetch task. All of these are transient
/// from the task's point of view: the job goes back to the queue with backoff
/// until its attempts run out.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("account lookup failed: {0}")]
    AccountError(#[from] AccountError),
    #[error("crypto failure: {0}")]
    CryptoError(#[from] CryptoError),
    #[error(transparent)]
    GmailError(#[from] GmailError),
    #[error("staging write failed: {0}")]
    StagingError(#[from] StagingError),
    #[error("queue operation failed: {0}")]
    QueueError(#[from] PgQueueError),
    #[error("slot store failure: {0}")]
    SlotError(#[from] anyhow::Error),
}
