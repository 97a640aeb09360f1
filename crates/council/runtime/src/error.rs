//! Error types for persistence

use council_engine::ReplayError;
use council_types::{CouncilError, WorkflowId};

/// Errors raised by audit sinks, snapshot stores and recovery
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit chain broken: {0}")]
    Integrity(String),

    #[error("Replay of {workflow} failed: {source}")]
    Replay {
        workflow: WorkflowId,
        #[source]
        source: ReplayError,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for CouncilError {
    fn from(err: StoreError) -> Self {
        CouncilError::Persistence(err.to_string())
    }
}
