use dura_types::DurableId;

use crate::traits::Lane;

/// Errors from merge steps and the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// A merge step failed; the repository stays scheduled.
    #[error("{lane} merge of {key} failed: {reason}")]
    StepFailed {
        lane: Lane,
        key: DurableId,
        reason: String,
    },

    /// A worker thread could not be started.
    #[error("cannot spawn merge worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl MergeError {
    pub fn step(lane: Lane, key: DurableId, reason: impl Into<String>) -> Self {
        Self::StepFailed {
            lane,
            key,
            reason: reason.into(),
        }
    }
}

/// Result alias for merge operations.
pub type MergeResult<T> = Result<T, MergeError>;
