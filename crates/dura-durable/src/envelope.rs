//! Persisted form of a durable: the TTL followed by type-specific state.

use dura_types::Ttl;
use serde::{Deserialize, Serialize};

use crate::error::{DurableError, DurableResult};

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ttl: Ttl,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn encode(ttl: Ttl, body: Vec<u8>) -> DurableResult<Vec<u8>> {
        bincode::serialize(&Envelope { ttl, body }).map_err(|e| DurableError::Encoding(e.to_string()))
    }

    pub fn decode(blob: &[u8]) -> DurableResult<Self> {
        bincode::deserialize(blob).map_err(|e| DurableError::Encoding(e.to_string()))
    }
}
