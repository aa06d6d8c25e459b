use sift_common::pgqueue::PgQueueError;
use sift_common::staging::StagingError;
use thiserror::Error;

/// Task-level errors for the classification stage. Per-row decrypt failures
/// drop the row with a warning; model failures route rows into the retry set.
#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("staging access failed: {0}")]
    StagingError(#[from] StagingError),
    #[error("queue operation failed: {0}")]
    QueueError(#[from] PgQueueError),
}
