use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use dura_types::{Deadline, DurableId, Ttl};

use crate::completion::Completion;
use crate::error::StoreResult;
use crate::record::StoredDurable;
use crate::traits::BackingStore;

/// In-memory, HashMap-based backing store.
///
/// Intended for tests and embedding. Every request is applied inline and its
/// completion is pushed before the call returns.
pub struct InMemoryBackingStore {
    records: RwLock<HashMap<DurableId, StoredDurable>>,
    saves: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryBackingStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            saves: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().expect("lock poisoned").is_empty()
    }

    /// The stored record for `id`, if any.
    pub fn record(&self, id: &DurableId) -> Option<StoredDurable> {
        self.records.read().expect("lock poisoned").get(id).cloned()
    }

    /// Total number of accepted saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    /// Total number of accepted deletes.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for InMemoryBackingStore {
    fn can_load(&self, id: &DurableId) -> StoreResult<bool> {
        Ok(self.records.read().expect("lock poisoned").contains_key(id))
    }

    fn try_load(&self, id: &DurableId) -> StoreResult<Option<Vec<u8>>> {
        let map = self.records.read().expect("lock poisoned");
        Ok(map.get(id).map(|record| record.blob.clone()))
    }

    fn save(
        &self,
        id: &DurableId,
        deadline: Deadline,
        ttl: Ttl,
        blob: Vec<u8>,
        done: Completion,
    ) -> StoreResult<()> {
        let record = StoredDurable::new(*id, deadline, ttl, blob);
        self.records.write().expect("lock poisoned").insert(*id, record);
        self.saves.fetch_add(1, Ordering::Relaxed);
        done.push(Ok(()));
        Ok(())
    }

    fn delete(&self, id: &DurableId, done: Completion) -> StoreResult<()> {
        self.records.write().expect("lock poisoned").remove(id);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        done.push(Ok(()));
        Ok(())
    }

    fn clean_disk(&self, now: Deadline, done: Completion<Vec<DurableId>>) -> StoreResult<()> {
        let mut map = self.records.write().expect("lock poisoned");
        let mut purged: Vec<DurableId> = map
            .values()
            .filter(|record| record.is_expired(now))
            .map(|record| record.id)
            .collect();
        purged.sort();
        for id in &purged {
            map.remove(id);
        }
        done.push(Ok(purged));
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryBackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackingStore")
            .field("record_count", &self.len())
            .finish()
    }
}
