use genq_core::{DomainError, JobId};

use super::config::ConfigError;
use super::store::JobStoreError;

/// Error surfaced by the job processor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor is already running")]
    AlreadyRunning,
    #[error("processor is not running")]
    NotRunning,
    #[error("shutdown deadline exceeded while stopping {phase}")]
    ShutdownTimeout { phase: &'static str },
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<genq_resilience::ConfigError> for ProcessorError {
    fn from(err: genq_resilience::ConfigError) -> Self {
        Self::Config(err.into())
    }
}
