use sift_common::applications::ApplicationError;
use sift_common::staging::StagingError;
use thiserror::Error;

/// Task-level errors for the transfer stage. A failure retries the whole
/// batch; the application table's conflict target makes the replay safe.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("staging access failed: {0}")]
    StagingError(#[from] StagingError),
    #[error("application insert failed: {0}")]
    ApplicationError(#[from] ApplicationError),
}
