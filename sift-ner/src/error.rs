use sift_common::inference::InferenceError;
use sift_common::staging::StagingError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NerError {
    #[error("staging access failed: {0}")]
    StagingError(#[from] StagingError),
    #[error("entity recognition failed: {0}")]
    InferenceError(#[from] InferenceError),
}
