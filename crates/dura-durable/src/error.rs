use std::fmt;

use dura_store::StoreError;
use dura_types::DurableId;

/// Where a conflicting durable was found by a strict create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    InCache,
    OnDisk,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InCache => write!(f, "in cache"),
            Self::OnDisk => write!(f, "on disk"),
        }
    }
}

/// Errors from opening, creating, and persisting durables.
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    /// A strict create found the id already open, cached, or stored.
    #[error("durable {id} already exists {location}")]
    AlreadyExists { id: DurableId, location: Location },

    /// The id is neither openable nor stored.
    #[error("durable {0} does not exist")]
    DoesNotExist(DurableId),

    /// The live object is not of the requested type.
    #[error("durable {id} is a {actual}, not a {expected}")]
    WrongType {
        id: DurableId,
        expected: &'static str,
        actual: &'static str,
    },

    /// Backing store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The persisted envelope or the object's own state failed to encode or
    /// decode.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The type-specific constructor rejected its input.
    #[error("cannot construct durable {id}: {reason}")]
    Construct { id: DurableId, reason: String },
}

impl DurableError {
    pub fn construct(id: DurableId, reason: impl Into<String>) -> Self {
        Self::Construct {
            id,
            reason: reason.into(),
        }
    }
}

/// Result alias for durable operations.
pub type DurableResult<T> = Result<T, DurableError>;
