use thiserror::Error;

use crate::zipsafe::ZipSafetyError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("zip safety violation: {0}")]
    ZipSafety(#[from] ZipSafetyError),

    #[error("too many pending compilations")]
    QueueFull,

    #[error("project fetch failed: {0}")]
    ProjectFetch(String),

    #[error("file materialization failed: {0}")]
    Materialize(String),

    #[error("compilation worker abandoned the job")]
    WorkerLost,
}
