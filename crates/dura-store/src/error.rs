use dura_types::DurableId;

/// Errors from backing store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record failed its checksum or could not be decoded.
    #[error("corrupt record for {id}: {reason}")]
    CorruptRecord { id: DurableId, reason: String },

    /// A frame was truncated or its checksum did not match.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// The store has shut down and no longer accepts requests.
    #[error("store is closed")]
    Closed,
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
