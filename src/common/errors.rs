//! Error taxonomy for the job pipeline.
//!
//! Every variant of [`JobError`] is recoverable at the job boundary: the
//! controller turns it into an `{"error": ...}` result document and moves on.

use log::error;
use thiserror::Error;

use crate::residency::ResidencyError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Bad extension, missing manifest fields, missing images, unknown model.
    #[error("{0}")]
    Validation(String),
    /// The artifact never stabilized or never became a readable archive.
    #[error("{0}")]
    Timeout(String),
    /// The archive was readable but could not be unpacked.
    #[error("{0}")]
    Extraction(String),
    /// The model failed to load or to run inference.
    #[error("{0}")]
    Backend(String),
    /// Anything outside the taxonomy, caught at the per-job boundary.
    #[error("{0}")]
    Internal(String),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation",
            JobError::Timeout(_) => "timeout",
            JobError::Extraction(_) => "extraction",
            JobError::Backend(_) => "backend",
            JobError::Internal(_) => "internal",
        }
    }
}

impl From<ResidencyError> for JobError {
    fn from(err: ResidencyError) -> Self {
        match err {
            ResidencyError::InvalidModel(_) => JobError::Validation(err.to_string()),
            ResidencyError::Backend(_) => JobError::Backend(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(err: tokio::task::JoinError) -> Self {
        JobError::Internal(format!("Job worker failed: {}", err))
    }
}

/// Log the whole context chain of `err` and hand it back to the caller.
pub fn handle_error(err: anyhow::Error) -> anyhow::Error {
    error!("{:?}", err);
    err
}
