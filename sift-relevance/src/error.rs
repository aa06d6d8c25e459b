use sift_common::pgqueue::PgQueueError;
use sift_common::staging::StagingError;
use thiserror::Error;

/// Task-level errors for the relevance stage. Per-row decrypt failures and
/// model errors never reach this type: the former drop the row with a
/// warning, the latter route the rows into the stage's retry set.
#[derive(Error, Debug)]
pub enum RelevanceError {
    #[error("staging access failed: {0}")]
    StagingError(#[from] StagingError),
    #[error("queue operation failed: {0}")]
    QueueError(#[from] PgQueueError),
}
