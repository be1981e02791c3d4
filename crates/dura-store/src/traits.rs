use dura_types::{Deadline, DurableId, Ttl};

use crate::completion::Completion;
use crate::error::StoreResult;

/// Persistent home of durable blobs.
///
/// All implementations must satisfy these invariants:
/// - Requests are applied in the order they were submitted.
/// - An accepted request (one returning `Ok`) pushes its completion exactly
///   once, possibly from another thread.
/// - A rejected request (one returning `Err`) never touches its completion.
/// - `can_load`/`try_load` reflect every accepted `save`/`delete`, even ones
///   whose completion has not been pushed yet.
///
/// The registry may call `save`, `delete`, and `clean_disk` while holding its
/// own lock, so implementations must not block on slow I/O inside them.
pub trait BackingStore: Send + Sync {
    /// Returns `true` if a blob is stored under `id`.
    fn can_load(&self, id: &DurableId) -> StoreResult<bool>;

    /// Fetch the blob stored under `id`.
    ///
    /// Returns `Ok(None)` if nothing is stored.
    fn try_load(&self, id: &DurableId) -> StoreResult<Option<Vec<u8>>>;

    /// Persist `blob` under `id`, replacing any previous blob.
    ///
    /// The deadline and TTL travel with the blob so that `clean_disk` can
    /// expire it without loading it.
    fn save(
        &self,
        id: &DurableId,
        deadline: Deadline,
        ttl: Ttl,
        blob: Vec<u8>,
        done: Completion,
    ) -> StoreResult<()>;

    /// Erase the blob stored under `id`. Erasing a missing blob is not an
    /// error.
    fn delete(&self, id: &DurableId, done: Completion) -> StoreResult<()>;

    /// Erase every blob whose deadline is `<= now`, reporting the ids erased.
    fn clean_disk(&self, now: Deadline, done: Completion<Vec<DurableId>>) -> StoreResult<()>;
}
