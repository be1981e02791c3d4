use dura_types::{Deadline, DurableId, Ttl};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// A durable's blob as kept by a backing store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDurable {
    pub id: DurableId,
    pub deadline: Deadline,
    pub ttl: Ttl,
    pub blob: Vec<u8>,
}

impl StoredDurable {
    pub fn new(id: DurableId, deadline: Deadline, ttl: Ttl, blob: Vec<u8>) -> Self {
        Self {
            id,
            deadline,
            ttl,
            blob,
        }
    }

    /// Returns `true` if the record may be erased at `now`.
    pub fn is_expired(&self, now: Deadline) -> bool {
        self.deadline.has_passed(now)
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}
