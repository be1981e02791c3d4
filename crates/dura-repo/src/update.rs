use std::collections::BTreeMap;

use dura_types::SeqNum;
use serde::{Deserialize, Serialize};

/// One sequenced write: a batch of key/value puts applied atomically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub seq: SeqNum,
    pub ops: BTreeMap<String, Vec<u8>>,
}

impl Update {
    pub fn new(seq: SeqNum, ops: BTreeMap<String, Vec<u8>>) -> Self {
        Self { seq, ops }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.ops.get(key).map(Vec::as_slice)
    }
}

/// Merge sequence-ordered batches into one ordered run, dropping every
/// update at or below `released_up_to`.
pub fn merge_sorted(batches: Vec<Vec<Update>>, released_up_to: SeqNum) -> Vec<Update> {
    let mut merged: Vec<Update> = batches
        .into_iter()
        .flatten()
        .filter(|update| update.seq > released_up_to)
        .collect();
    merged.sort_by_key(|update| update.seq);
    merged.dedup_by_key(|update| update.seq);
    merged
}

#[cfg(test)]
pub(crate) fn put(seq: SeqNum, key: &str, value: &str) -> Update {
    let mut ops = BTreeMap::new();
    ops.insert(key.to_string(), value.as_bytes().to_vec());
    Update::new(seq, ops)
}
