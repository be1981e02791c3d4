use std::any::{type_name, Any};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use dura_store::{BackingStore, Completion};
use dura_types::{Deadline, DurableId, Ttl};
use tracing::{debug, error, warn};

use crate::config::RegistryConfig;
use crate::durable::{Durable, Origin};
use crate::envelope::Envelope;
use crate::error::{DurableError, DurableResult, Location};
use crate::handle::{Handle, Severed};

/// Bookkeeping for one openable durable.
struct Record {
    object: Arc<dyn Durable>,
    any: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    ttl: Ttl,
    /// Set exactly while the durable is closed and cached.
    deadline: Option<Deadline>,
    on_disk: bool,
    ref_count: usize,
}

impl Record {
    fn new<T: Durable>(object: Arc<T>, ttl: Ttl, on_disk: bool) -> Self {
        let any: Arc<dyn Any + Send + Sync> = object.clone();
        Self {
            object,
            any,
            type_name: type_name::<T>(),
            ttl,
            deadline: None,
            on_disk,
            ref_count: 0,
        }
    }

    fn downcast<T: Durable>(&self, id: DurableId) -> DurableResult<Arc<T>> {
        Arc::clone(&self.any)
            .downcast::<T>()
            .map_err(|_| DurableError::WrongType {
                id,
                expected: type_name::<T>(),
                actual: self.type_name,
            })
    }
}

enum Slot {
    /// Claimed by a thread that is constructing or loading the durable.
    Loading,
    Ready(Record),
}

#[derive(Clone, Copy)]
enum Seen {
    Missing,
    Loading,
    Ready,
}

#[derive(Default)]
struct RegistryState {
    /// Every durable that is open, cached, or being loaded.
    openable: HashMap<DurableId, Slot>,
    /// Closed but cached durables, soonest deadline first. Every member is
    /// `Ready` in `openable` with a zero count.
    closed: BTreeSet<(Deadline, DurableId)>,
}

impl RegistryState {
    fn seen(&self, id: &DurableId) -> Seen {
        match self.openable.get(id) {
            None => Seen::Missing,
            Some(Slot::Loading) => Seen::Loading,
            Some(Slot::Ready(_)) => Seen::Ready,
        }
    }

    fn ready(&self, id: &DurableId) -> Option<&Record> {
        match self.openable.get(id) {
            Some(Slot::Ready(record)) => Some(record),
            _ => None,
        }
    }

    fn ready_mut(&mut self, id: &DurableId) -> &mut Record {
        match self.openable.get_mut(id) {
            Some(Slot::Ready(record)) => record,
            _ => panic!("durable {id} is not open"),
        }
    }

    /// Remove a closed durable from the openable map and the cache.
    fn retire(&mut self, id: &DurableId, discard: bool) -> Retired {
        let record = match self.openable.remove(id) {
            Some(Slot::Ready(record)) => record,
            _ => panic!("retiring durable {id} that is not ready"),
        };
        assert_eq!(
            record.ref_count, 0,
            "retiring durable {id} with live handles"
        );
        if let Some(deadline) = record.deadline {
            self.closed.remove(&(deadline, *id));
        }
        record.object.on_retire();
        Retired { record, discard }
    }

    fn unreferenced(&self) -> Vec<DurableId> {
        self.openable
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Ready(record) if record.ref_count == 0 => Some(*id),
                _ => None,
            })
            .collect()
    }
}

/// A record removed from the registry, finished once the lock is dropped.
struct Retired {
    record: Record,
    discard: bool,
}

impl Retired {
    fn finish(self) {
        if self.discard {
            self.record.object.on_discard();
        }
    }
}

/// Work left over from a close transition, run without the registry lock.
struct Closing {
    id: DurableId,
    kind: &'static str,
    action: &'static str,
    pending: Option<Completion>,
    dependents: Vec<Severed>,
    retired: Vec<Retired>,
}

impl Closing {
    fn finish(self) {
        for dependent in self.dependents {
            let dependent_id = dependent.id();
            if panic::catch_unwind(AssertUnwindSafe(|| dependent.release())).is_err() {
                error!(
                    id = %self.id,
                    dependent = %dependent_id,
                    "while releasing dependent of durable {}", self.kind
                );
            }
        }
        if let Some(done) = self.pending {
            if let Err(err) = done.wait() {
                error!(id = %self.id, error = %err, "while {} durable {}", self.action, self.kind);
            }
        }
        for retired in self.retired {
            retired.finish();
        }
    }
}

/// State shared between the registry and every handle it issued.
pub(crate) struct Shared {
    config: RegistryConfig,
    store: Arc<dyn BackingStore>,
    state: Mutex<RegistryState>,
    /// Signalled whenever a `Loading` slot is resolved either way.
    loaded: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("registry lock poisoned")
    }

    pub(crate) fn acquire(&self, id: &DurableId) {
        let mut state = self.lock();
        let record = state.ready_mut(id);
        assert!(record.ref_count > 0, "cloned a handle to closed durable {id}");
        record.ref_count += 1;
    }

    /// Drop one count; the last one runs the close protocol.
    pub(crate) fn release(&self, id: DurableId) {
        let closing = {
            let mut state = self.lock();
            let record = state.ready_mut(&id);
            assert!(record.ref_count > 0, "released durable {id} more times than acquired");
            record.ref_count -= 1;
            if record.ref_count > 0 {
                return;
            }
            self.close_locked(&mut state, id)
        };
        closing.finish();
    }

    pub(crate) fn ttl_of(&self, id: &DurableId) -> Ttl {
        self.lock().ready_mut(id).ttl
    }

    pub(crate) fn set_ttl(&self, id: &DurableId, ttl: Ttl) {
        let mut state = self.lock();
        let record = state.ready_mut(id);
        assert!(record.deadline.is_none(), "changing the TTL of closed durable {id}");
        record.ttl = ttl;
    }

    pub(crate) fn ref_count_of(&self, id: &DurableId) -> usize {
        self.lock().ready(id).map_or(0, |record| record.ref_count)
    }

    fn persist(
        &self,
        id: &DurableId,
        deadline: Deadline,
        ttl: Ttl,
        object: &dyn Durable,
    ) -> DurableResult<Completion> {
        let blob = Envelope::encode(ttl, object.write_state()?)?;
        let done = Completion::new();
        self.store.save(id, deadline, ttl, blob, done.clone())?;
        Ok(done)
    }

    /// The state-transition half of the close protocol. Everything that may
    /// block is returned in the [`Closing`] for the caller to finish after
    /// the lock is released.
    fn close_locked(&self, state: &mut RegistryState, id: DurableId) -> Closing {
        let record = state.ready_mut(&id);
        let object = Arc::clone(&record.object);
        let kind = object.kind();
        let ttl = record.ttl;

        if ttl.is_zero() {
            let pending = if record.on_disk {
                let done = Completion::new();
                match self.store.delete(&id, done.clone()) {
                    Ok(()) => {
                        record.on_disk = false;
                        Some(done)
                    }
                    Err(err) => {
                        error!(id = %id, error = %err, "while deleting durable {kind}");
                        None
                    }
                }
            } else {
                None
            };
            let dependents = object.sever_dependents();
            let retired = vec![state.retire(&id, true)];
            debug!(id = %id, kind, "durable destroyed on close");
            return Closing {
                id,
                kind,
                action: "deleting",
                pending,
                dependents,
                retired,
            };
        }

        let deadline = Deadline::now().after(ttl);
        record.deadline = Some(deadline);
        let pending = match self.persist(&id, deadline, ttl, object.as_ref()) {
            Ok(done) => {
                record.on_disk = true;
                Some(done)
            }
            Err(err) => {
                error!(id = %id, error = %err, "while saving durable {kind}");
                None
            }
        };
        let dependents = object.sever_dependents();
        let retired = if pending.is_some() {
            self.cache_locked(state, id, deadline)
        } else {
            vec![state.retire(&id, false)]
        };
        Closing {
            id,
            kind,
            action: "saving",
            pending,
            dependents,
            retired,
        }
    }

    /// Insert a just-closed durable into the cache, evicting the soonest
    /// deadlines to make room. A durable that would itself be the soonest
    /// in a full cache is not cached.
    fn cache_locked(&self, state: &mut RegistryState, id: DurableId, deadline: Deadline) -> Vec<Retired> {
        let mut retired = Vec::new();
        if !self.config.caching_enabled() {
            retired.push(state.retire(&id, false));
            return retired;
        }
        let key = (deadline, id);
        while state.closed.len() >= self.config.max_cache_size {
            let Some(&soonest) = state.closed.first() else {
                break;
            };
            if key < soonest {
                debug!(id = %id, deadline = %deadline, "closed durable expires first; not cached");
                retired.push(state.retire(&id, false));
                return retired;
            }
            debug!(id = %soonest.1, deadline = %soonest.0, "evicting cached durable");
            retired.push(state.retire(&soonest.1, false));
        }
        state.closed.insert(key);
        debug!(id = %id, deadline = %deadline, cached = state.closed.len(), "durable cached");
        retired
    }
}

/// Reserved `Loading` slot; rolled back on drop unless fulfilled.
struct Reservation {
    shared: Arc<Shared>,
    id: DurableId,
    armed: bool,
}

impl Reservation {
    fn new(shared: Arc<Shared>, id: DurableId) -> Self {
        Self {
            shared,
            id,
            armed: true,
        }
    }

    /// Publish the constructed object and hand out its first handle.
    fn fulfil<T: Durable>(mut self, object: Arc<T>, ttl: Ttl, on_disk: bool) -> Handle<T> {
        let mut record = Record::new(Arc::clone(&object), ttl, on_disk);
        assert_eq!(record.ref_count, 0, "new durable {} already counted", self.id);
        record.ref_count = 1;
        {
            let mut state = self.shared.lock();
            let previous = state.openable.insert(self.id, Slot::Ready(record));
            assert!(
                matches!(previous, Some(Slot::Loading)),
                "reservation for durable {} was lost",
                self.id
            );
            self.shared.loaded.notify_all();
        }
        self.armed = false;
        Handle::adopt(object, self.id, Arc::clone(&self.shared))
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(state.openable.get(&self.id), Some(Slot::Loading)) {
            state.openable.remove(&self.id);
        }
        self.shared.loaded.notify_all();
        debug!(id = %self.id, "durable reservation rolled back");
    }
}

enum Claim<T: Durable> {
    Open(Handle<T>),
    Reserved(Reservation),
}

/// Outcome of [`Registry::clean`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// Cached durables destroyed because their deadline passed.
    pub evicted: Vec<DurableId>,
    /// Ids erased from the backing store that are no longer openable.
    pub purged: Vec<DurableId>,
}

/// The single authority over open and cached durables.
///
/// Holds the openable map and the deadline-ordered cache of closed durables
/// behind one mutex. Concurrent opens of the same unseen id are serialized:
/// the first caller claims the slot and loads or constructs the object while
/// the others wait on a condition variable, then adopt the published object.
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    pub fn new(config: RegistryConfig, store: Arc<dyn BackingStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                state: Mutex::new(RegistryState::default()),
                loaded: Condvar::new(),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.shared.store
    }

    /// Open `id`, loading it from the backing store or building it fresh.
    ///
    /// `ttl` applies only to freshly built durables; a loaded durable keeps
    /// the TTL it was persisted with.
    pub fn open_or_create<T, F>(&self, id: DurableId, ttl: Ttl, build: F) -> DurableResult<Handle<T>>
    where
        T: Durable,
        F: FnOnce(Origin<'_>) -> DurableResult<Arc<T>>,
    {
        let reservation = match self.claim::<T>(id)? {
            Claim::Open(handle) => return Ok(handle),
            Claim::Reserved(reservation) => reservation,
        };
        match self.shared.store.try_load(&id)? {
            Some(blob) => {
                let envelope = Envelope::decode(&blob)?;
                let object = build(Origin::Loaded(&envelope.body))?;
                debug!(id = %id, kind = object.kind(), "durable loaded");
                Ok(reservation.fulfil(object, envelope.ttl, true))
            }
            None => {
                let object = build(Origin::New)?;
                debug!(id = %id, kind = object.kind(), ttl = %ttl, "durable created");
                Ok(reservation.fulfil(object, ttl, false))
            }
        }
    }

    /// Create `id`, failing if it is already openable or stored.
    ///
    /// A durable created with a non-zero TTL is persisted before the first
    /// handle is returned.
    pub fn create<T, F>(&self, id: DurableId, ttl: Ttl, build: F) -> DurableResult<Handle<T>>
    where
        T: Durable,
        F: FnOnce() -> DurableResult<Arc<T>>,
    {
        let reservation = {
            let mut state = self.shared.lock();
            if state.openable.contains_key(&id) {
                return Err(DurableError::AlreadyExists {
                    id,
                    location: Location::InCache,
                });
            }
            state.openable.insert(id, Slot::Loading);
            Reservation::new(Arc::clone(&self.shared), id)
        };
        if self.shared.store.can_load(&id)? {
            return Err(DurableError::AlreadyExists {
                id,
                location: Location::OnDisk,
            });
        }
        let object = build()?;
        let on_disk = !ttl.is_zero();
        if on_disk {
            let deadline = Deadline::now().after(ttl);
            self.shared.persist(&id, deadline, ttl, object.as_ref())?.wait()?;
        }
        debug!(id = %id, kind = object.kind(), ttl = %ttl, "durable created");
        Ok(reservation.fulfil(object, ttl, on_disk))
    }

    /// Open `id` without creating it.
    pub fn force_open<T, F>(&self, id: DurableId, restore: F) -> DurableResult<Handle<T>>
    where
        T: Durable,
        F: FnOnce(&[u8]) -> DurableResult<Arc<T>>,
    {
        let reservation = match self.claim::<T>(id)? {
            Claim::Open(handle) => return Ok(handle),
            Claim::Reserved(reservation) => reservation,
        };
        let blob = self
            .shared
            .store
            .try_load(&id)?
            .ok_or(DurableError::DoesNotExist(id))?;
        let envelope = Envelope::decode(&blob)?;
        let object = restore(&envelope.body)?;
        debug!(id = %id, kind = object.kind(), "durable loaded");
        Ok(reservation.fulfil(object, envelope.ttl, true))
    }

    /// Find `id` among the openable durables or reserve its slot.
    fn claim<T: Durable>(&self, id: DurableId) -> DurableResult<Claim<T>> {
        let mut state = self.shared.lock();
        loop {
            match state.seen(&id) {
                Seen::Loading => {
                    state = self
                        .shared
                        .loaded
                        .wait(state)
                        .expect("registry lock poisoned");
                }
                Seen::Missing => {
                    state.openable.insert(id, Slot::Loading);
                    return Ok(Claim::Reserved(Reservation::new(Arc::clone(&self.shared), id)));
                }
                Seen::Ready => {
                    let RegistryState { openable, closed } = &mut *state;
                    let Some(Slot::Ready(record)) = openable.get_mut(&id) else {
                        unreachable!("slot for {id} changed under the lock");
                    };
                    let object = record.downcast::<T>(id)?;
                    record.ref_count += 1;
                    if let Some(deadline) = record.deadline.take() {
                        debug_assert_eq!(record.ref_count, 1);
                        let was_cached = closed.remove(&(deadline, id));
                        debug_assert!(was_cached, "closed durable {id} missing from cache");
                        debug!(id = %id, "durable reopened from cache");
                    }
                    return Ok(Claim::Open(Handle::adopt(object, id, Arc::clone(&self.shared))));
                }
            }
        }
    }

    /// Destroy the closed durable `id`. Returns `false` if it is not
    /// openable.
    ///
    /// # Panics
    ///
    /// If any handle to `id` is still alive.
    pub fn destroy(&self, id: &DurableId) -> bool {
        let (live, retired) = {
            let mut state = self.shared.lock();
            match state.ready(id).map(|record| record.ref_count) {
                None => return false,
                Some(0) => (0, Some(state.retire(id, false))),
                Some(live) => (live, None),
            }
        };
        assert_eq!(live, 0, "destroying durable {id} with {live} live handles");
        if let Some(retired) = retired {
            retired.finish();
        }
        true
    }

    /// Destroy cached durables whose deadline is `<= now`, then expire the
    /// backing store and wait for it.
    pub fn clean(&self, now: Deadline) -> DurableResult<CleanReport> {
        let done = Completion::new();
        let (evicted, retired, submitted, shielded) = {
            let mut state = self.shared.lock();
            let evicted: Vec<DurableId> = state
                .closed
                .iter()
                .take_while(|(deadline, _)| deadline.has_passed(now))
                .map(|(_, id)| *id)
                .collect();
            let retired: Vec<Retired> = evicted.iter().map(|id| state.retire(id, true)).collect();
            let submitted = self.shared.store.clean_disk(now, done.clone());
            let shielded: HashSet<DurableId> = state.openable.keys().copied().collect();
            (evicted, retired, submitted, shielded)
        };

        for r in retired {
            r.finish();
        }
        if let Err(err) = submitted {
            warn!(error = %err, "while cleaning backing store");
            return Err(err.into());
        }
        let mut purged = done.wait()?;
        {
            let state = self.shared.lock();
            purged.retain(|id| !shielded.contains(id) && !state.openable.contains_key(id));
        }
        debug!(evicted = evicted.len(), purged = purged.len(), now = %now, "registry cleaned");
        Ok(CleanReport { evicted, purged })
    }

    /// Destroy every openable durable with no live handles.
    pub fn close_all_unreferenced(&self) -> usize {
        let retired: Vec<Retired> = {
            let mut state = self.shared.lock();
            state
                .unreferenced()
                .iter()
                .map(|id| state.retire(id, false))
                .collect()
        };
        let count = retired.len();
        for r in retired {
            r.finish();
        }
        if count > 0 {
            debug!(count, "unreferenced durables closed");
        }
        count
    }

    /// Destroy everything.
    ///
    /// # Panics
    ///
    /// If any handle is still alive or any durable is still loading.
    pub fn clear(&self) {
        let retired: Vec<Retired> = {
            let mut state = self.shared.lock();
            let busy = state.openable.len() - state.unreferenced().len();
            if busy > 0 {
                drop(state);
                panic!("clearing registry with {busy} durables still in use");
            }
            state
                .unreferenced()
                .iter()
                .map(|id| state.retire(id, false))
                .collect()
        };
        for r in retired {
            r.finish();
        }
    }

    // ---- Introspection ----

    /// Returns `true` if `id` is open or cached.
    pub fn is_openable(&self, id: &DurableId) -> bool {
        self.shared.lock().ready(id).is_some()
    }

    /// Returns `true` if `id` is closed and cached.
    pub fn is_cached(&self, id: &DurableId) -> bool {
        self.shared
            .lock()
            .ready(id)
            .is_some_and(|record| record.deadline.is_some())
    }

    /// Number of closed durables in the cache.
    pub fn cached_len(&self) -> usize {
        self.shared.lock().closed.len()
    }

    /// Number of open or cached durables.
    pub fn openable_len(&self) -> usize {
        self.shared
            .lock()
            .openable
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Live handle count of `id`, or `None` if it is not openable.
    pub fn ref_count(&self, id: &DurableId) -> Option<usize> {
        self.shared.lock().ready(id).map(|record| record.ref_count)
    }

    /// Expiry of a cached durable.
    pub fn deadline(&self, id: &DurableId) -> Option<Deadline> {
        self.shared.lock().ready(id).and_then(|record| record.deadline)
    }

    /// Whether `id` has been persisted since it was last loaded or created.
    pub fn is_on_disk(&self, id: &DurableId) -> Option<bool> {
        self.shared.lock().ready(id).map(|record| record.on_disk)
    }

    /// Cached ids, soonest deadline first.
    pub fn cached_ids(&self) -> Vec<DurableId> {
        self.shared.lock().closed.iter().map(|(_, id)| *id).collect()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.close_all_unreferenced();
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("openable", &self.openable_len())
            .field("cached", &self.cached_len())
            .field("max_cache_size", &self.shared.config.max_cache_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dura_store::{DirBackingStore, InMemoryBackingStore, StoreError, StoreResult};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    /// Minimal durable whose state is a single counter.
    struct Counter {
        value: AtomicU64,
        discarded: Arc<AtomicUsize>,
        retired: AtomicBool,
    }

    impl Counter {
        fn build(origin: Origin<'_>, discarded: &Arc<AtomicUsize>) -> DurableResult<Arc<Self>> {
            let value = match origin {
                Origin::New => 0,
                Origin::Loaded(body) => {
                    let bytes: [u8; 8] = body
                        .try_into()
                        .map_err(|_| DurableError::Encoding("counter body".into()))?;
                    u64::from_le_bytes(bytes)
                }
            };
            Ok(Arc::new(Self {
                value: AtomicU64::new(value),
                discarded: Arc::clone(discarded),
                retired: AtomicBool::new(false),
            }))
        }

        fn bump(&self) -> u64 {
            self.value.fetch_add(1, Ordering::SeqCst) + 1
        }

        fn get(&self) -> u64 {
            self.value.load(Ordering::SeqCst)
        }

        fn is_retired(&self) -> bool {
            self.retired.load(Ordering::SeqCst)
        }
    }

    impl Durable for Counter {
        fn kind(&self) -> &'static str {
            "counter"
        }

        fn write_state(&self) -> DurableResult<Vec<u8>> {
            Ok(self.get().to_le_bytes().to_vec())
        }

        fn on_retire(&self) {
            self.retired.store(true, Ordering::SeqCst);
        }

        fn on_discard(&self) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Durable holding a handle to another durable.
    struct Child {
        parent: Mutex<Option<Handle<Counter>>>,
    }

    impl Durable for Child {
        fn kind(&self) -> &'static str {
            "child"
        }

        fn write_state(&self) -> DurableResult<Vec<u8>> {
            Ok(Vec::new())
        }

        fn sever_dependents(&self) -> Vec<Severed> {
            self.parent
                .lock()
                .expect("lock poisoned")
                .take()
                .map(Handle::into_severed)
                .into_iter()
                .collect()
        }
    }

    /// Store whose saves are always rejected.
    struct RejectingStore;

    impl BackingStore for RejectingStore {
        fn can_load(&self, _id: &DurableId) -> StoreResult<bool> {
            Ok(false)
        }
        fn try_load(&self, _id: &DurableId) -> StoreResult<Option<Vec<u8>>> {
            Ok(None)
        }
        fn save(&self, _: &DurableId, _: Deadline, _: Ttl, _: Vec<u8>, _: Completion) -> StoreResult<()> {
            Err(StoreError::Closed)
        }
        fn delete(&self, _id: &DurableId, _done: Completion) -> StoreResult<()> {
            Err(StoreError::Closed)
        }
        fn clean_disk(&self, _now: Deadline, _done: Completion<Vec<DurableId>>) -> StoreResult<()> {
            Err(StoreError::Closed)
        }
    }

    struct Fixture {
        store: Arc<InMemoryBackingStore>,
        registry: Registry,
        discarded: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new(max_cache_size: usize) -> Self {
            let store = Arc::new(InMemoryBackingStore::new());
            let registry = Registry::new(
                RegistryConfig::with_max_cache_size(max_cache_size),
                Arc::clone(&store) as Arc<dyn BackingStore>,
            );
            Self {
                store,
                registry,
                discarded: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn open(&self, id: DurableId, ttl: Ttl) -> Handle<Counter> {
            let discarded = Arc::clone(&self.discarded);
            self.registry
                .open_or_create(id, ttl, |origin| Counter::build(origin, &discarded))
                .unwrap()
        }

        fn assert_cache_consistent(&self) {
            let state = self.registry.shared.lock();
            for (deadline, id) in &state.closed {
                let record = state.ready(id).expect("cached durable must be openable");
                assert_eq!(record.ref_count, 0);
                assert_eq!(record.deadline, Some(*deadline));
            }
            let unreferenced = state.unreferenced().len();
            assert_eq!(unreferenced, state.closed.len());
        }
    }

    // ---- Open / create ----

    #[test]
    fn open_or_create_builds_then_shares() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        let a = fx.open(id, Ttl::from_secs(5));
        let b = fx.open(id, Ttl::from_secs(5));
        assert!(Handle::ptr_eq(&a, &b));
        assert_eq!(fx.registry.ref_count(&id), Some(2));
        assert_eq!(a.bump(), 1);
        assert_eq!(b.get(), 1);
        assert_eq!(fx.registry.is_on_disk(&id), Some(false));
    }

    #[test]
    fn create_rejects_open_and_stored_ids() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        let discarded = Arc::clone(&fx.discarded);
        let handle = fx
            .registry
            .create(id, Ttl::from_secs(5), || Counter::build(Origin::New, &discarded))
            .unwrap();
        // Non-zero TTL persists on create.
        assert_eq!(fx.store.save_count(), 1);
        assert_eq!(fx.registry.is_on_disk(&id), Some(true));

        let err = fx
            .registry
            .create(id, Ttl::from_secs(5), || Counter::build(Origin::New, &discarded))
            .unwrap_err();
        assert!(matches!(err, DurableError::AlreadyExists { location: Location::InCache, .. }));

        drop(handle);
        fx.registry.close_all_unreferenced();
        assert!(!fx.registry.is_openable(&id));
        let err = fx
            .registry
            .create(id, Ttl::from_secs(5), || Counter::build(Origin::New, &discarded))
            .unwrap_err();
        assert!(matches!(err, DurableError::AlreadyExists { location: Location::OnDisk, .. }));
        // The failed create left no slot behind.
        assert!(!fx.registry.is_openable(&id));
        assert_eq!(fx.registry.openable_len(), 0);
    }

    #[test]
    fn force_open_requires_existing() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        let discarded = Arc::clone(&fx.discarded);
        let err = fx
            .registry
            .force_open(id, |body| Counter::build(Origin::Loaded(body), &discarded))
            .unwrap_err();
        assert!(matches!(err, DurableError::DoesNotExist(missing) if missing == id));

        let handle = fx.open(id, Ttl::from_secs(5));
        handle.bump();
        handle.bump();
        drop(handle);
        fx.registry.close_all_unreferenced();

        let reopened = fx
            .registry
            .force_open(id, |body| Counter::build(Origin::Loaded(body), &discarded))
            .unwrap();
        assert_eq!(reopened.get(), 2);
        assert_eq!(reopened.ttl(), Ttl::from_secs(5));
    }

    #[test]
    fn wrong_type_is_reported() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        let _counter = fx.open(id, Ttl::from_secs(5));
        let err = fx
            .registry
            .open_or_create(id, Ttl::ZERO, |_| {
                Ok(Arc::new(Child {
                    parent: Mutex::new(None),
                }))
            })
            .unwrap_err();
        match err {
            DurableError::WrongType { expected, actual, .. } => {
                assert!(expected.ends_with("Child"));
                assert!(actual.ends_with("Counter"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.registry.ref_count(&id), Some(1));
    }

    #[test]
    fn failed_build_rolls_back_slot() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        let err = fx
            .registry
            .open_or_create::<Counter, _>(id, Ttl::ZERO, |_| Err(DurableError::construct(id, "boom")))
            .unwrap_err();
        assert!(matches!(err, DurableError::Construct { .. }));
        assert!(!fx.registry.is_openable(&id));

        let handle = fx.open(id, Ttl::ZERO);
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn loaded_durable_keeps_persisted_ttl() {
        let fx = Fixture::new(0);
        let id = DurableId::new();
        fx.open(id, Ttl::from_secs(7)).bump();
        assert!(!fx.registry.is_openable(&id));

        let reopened = fx.open(id, Ttl::from_secs(1));
        assert_eq!(reopened.ttl(), Ttl::from_secs(7));
        assert_eq!(reopened.get(), 1);
        assert_eq!(fx.registry.is_on_disk(&id), Some(true));
    }

    // ---- At most one loader ----

    #[test]
    fn concurrent_opens_build_once() {
        let fx = Arc::new(Fixture::new(10));
        let id = DurableId::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fx = Arc::clone(&fx);
                let builds = Arc::clone(&builds);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let discarded = Arc::clone(&fx.discarded);
                    fx.registry
                        .open_or_create(id, Ttl::from_secs(5), |origin| {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Counter::build(origin, &discarded)
                        })
                        .unwrap()
                })
            })
            .collect();

        let opened: Vec<Handle<Counter>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(opened.iter().all(|h| Handle::ptr_eq(h, &opened[0])));
        assert_eq!(fx.registry.ref_count(&id), Some(8));
    }

    #[test]
    fn waiters_retry_after_failed_load() {
        let fx = Arc::new(Fixture::new(10));
        let id = DurableId::new();
        let builds = Arc::new(AtomicUsize::new(0));

        let failing = {
            let fx = Arc::clone(&fx);
            let builds = Arc::clone(&builds);
            thread::spawn(move || {
                fx.registry.open_or_create::<Counter, _>(id, Ttl::ZERO, |_| {
                    builds.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(60));
                    Err(DurableError::construct(id, "first loader fails"))
                })
            })
        };
        thread::sleep(Duration::from_millis(15));
        let discarded = Arc::clone(&fx.discarded);
        let handle = fx
            .registry
            .open_or_create(id, Ttl::ZERO, |origin| {
                builds.fetch_add(1, Ordering::SeqCst);
                Counter::build(origin, &discarded)
            })
            .unwrap();

        assert!(failing.join().unwrap().is_err());
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(handle.ref_count(), 1);
    }

    // ---- Reference counting and close ----

    #[test]
    fn last_drop_closes_exactly_once() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        let a = fx.open(id, Ttl::from_secs(5));
        let b = a.clone();
        let c = b.clone();
        assert_eq!(fx.registry.ref_count(&id), Some(3));

        drop(a);
        drop(c);
        assert_eq!(fx.registry.ref_count(&id), Some(1));
        assert_eq!(fx.store.save_count(), 0);
        assert!(!fx.registry.is_cached(&id));

        drop(b);
        assert_eq!(fx.registry.ref_count(&id), Some(0));
        assert_eq!(fx.store.save_count(), 1);
        assert!(fx.registry.is_cached(&id));
        fx.assert_cache_consistent();
    }

    #[test]
    fn close_sets_deadline_and_reopen_clears_it() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        let ttl = Ttl::from_secs(5);

        let before = Deadline::now();
        drop(fx.open(id, ttl));
        let after = Deadline::now();

        let deadline = fx.registry.deadline(&id).unwrap();
        assert!(deadline >= before.after(ttl) && deadline <= after.after(ttl));
        assert_eq!(fx.registry.cached_ids(), vec![id]);
        assert_eq!(fx.store.record(&id).unwrap().deadline, deadline);

        let reopened = fx.open(id, ttl);
        assert!(fx.registry.deadline(&id).is_none());
        assert!(!fx.registry.is_cached(&id));
        assert_eq!(fx.registry.cached_len(), 0);
        assert_eq!(reopened.ref_count(), 1);
        fx.assert_cache_consistent();
    }

    #[test]
    fn zero_ttl_destroys_on_close() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        drop(fx.open(id, Ttl::ZERO));
        assert!(!fx.registry.is_openable(&id));
        assert_eq!(fx.registry.cached_len(), 0);
        assert_eq!(fx.discarded.load(Ordering::SeqCst), 1);
        // Never persisted, so nothing to delete.
        assert_eq!(fx.store.delete_count(), 0);
    }

    #[test]
    fn zero_ttl_deletes_persisted_state() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        drop(fx.open(id, Ttl::from_secs(5)));
        assert!(fx.store.can_load(&id).unwrap());

        let handle = fx.open(id, Ttl::from_secs(5));
        handle.set_ttl(Ttl::ZERO);
        drop(handle);

        assert!(!fx.registry.is_openable(&id));
        assert!(!fx.store.can_load(&id).unwrap());
        assert_eq!(fx.store.delete_count(), 1);
    }

    #[test]
    fn rejected_save_destroys_without_caching() {
        let registry = Registry::new(RegistryConfig::default(), Arc::new(RejectingStore));
        let discarded = Arc::new(AtomicUsize::new(0));
        let id = DurableId::new();
        let handle = registry
            .open_or_create(id, Ttl::from_secs(5), |origin| Counter::build(origin, &discarded))
            .unwrap();
        drop(handle);
        assert!(!registry.is_openable(&id));
        assert_eq!(registry.cached_len(), 0);
    }

    #[test]
    fn closing_releases_dependents() {
        let fx = Fixture::new(10);
        let parent_id = DurableId::new();
        let child_id = DurableId::new();

        let parent = fx.open(parent_id, Ttl::from_secs(5));
        let child = fx
            .registry
            .open_or_create(child_id, Ttl::ZERO, |_| {
                Ok(Arc::new(Child {
                    parent: Mutex::new(Some(parent.clone())),
                }))
            })
            .unwrap();
        drop(parent);
        assert_eq!(fx.registry.ref_count(&parent_id), Some(1));

        drop(child);
        assert!(!fx.registry.is_openable(&child_id));
        assert_eq!(fx.registry.ref_count(&parent_id), Some(0));
        assert!(fx.registry.is_cached(&parent_id));
        fx.assert_cache_consistent();
    }

    // ---- Cache eviction ----

    #[test]
    fn full_cache_evicts_soonest_deadline() {
        let fx = Fixture::new(3);
        let ids: Vec<DurableId> = (0..5).map(|_| DurableId::new()).collect();
        for (id, secs) in ids.iter().zip([5, 1, 4, 2, 3]) {
            drop(fx.open(*id, Ttl::from_secs(secs)));
        }
        let mut cached = fx.registry.cached_ids();
        cached.sort();
        let mut expected = vec![ids[0], ids[2], ids[4]];
        expected.sort();
        assert_eq!(cached, expected);
        // Evicted durables remain loadable from the store.
        assert!(fx.store.can_load(&ids[1]).unwrap());
        assert!(!fx.registry.is_openable(&ids[1]));
        fx.assert_cache_consistent();
    }

    #[test]
    fn zero_cache_size_never_caches() {
        let fx = Fixture::new(0);
        let id = DurableId::new();
        drop(fx.open(id, Ttl::from_secs(5)));
        assert!(!fx.registry.is_openable(&id));
        assert!(fx.store.can_load(&id).unwrap());
        assert_eq!(fx.discarded.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn cache_keeps_furthest_deadlines(
            ttls in proptest::collection::hash_set(1u64..60, 1..10),
            max in 1usize..5,
        ) {
            let fx = Fixture::new(max);
            let mut opened = Vec::new();
            for secs in ttls {
                let id = DurableId::new();
                drop(fx.open(id, Ttl::from_secs(secs)));
                opened.push((secs, id));
            }
            opened.sort_by(|a, b| b.0.cmp(&a.0));
            let mut expected: Vec<DurableId> = opened.iter().take(max).map(|(_, id)| *id).collect();
            expected.sort();
            let mut cached = fx.registry.cached_ids();
            cached.sort();
            prop_assert_eq!(cached, expected);
            fx.assert_cache_consistent();
        }
    }

    // ---- Retirement ----

    #[test]
    fn every_retirement_runs_retire_hook() {
        let fx = Fixture::new(1);

        let swept = fx.open(DurableId::new(), Ttl::from_secs(5));
        let swept_obj = Arc::clone(swept.as_arc());
        drop(swept);
        assert!(!swept_obj.is_retired());
        assert_eq!(fx.registry.close_all_unreferenced(), 1);
        assert!(swept_obj.is_retired());

        let zero = fx.open(DurableId::new(), Ttl::ZERO);
        let zero_obj = Arc::clone(zero.as_arc());
        drop(zero);
        assert!(zero_obj.is_retired());

        let sooner = fx.open(DurableId::new(), Ttl::from_secs(5));
        let sooner_obj = Arc::clone(sooner.as_arc());
        drop(sooner);
        assert!(!sooner_obj.is_retired());
        drop(fx.open(DurableId::new(), Ttl::from_secs(60)));
        assert!(sooner_obj.is_retired());
    }

    #[test]
    fn reopened_durable_is_a_fresh_object() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        let first = fx.open(id, Ttl::from_secs(5));
        first.bump();
        let stale = Arc::clone(first.as_arc());
        drop(first);
        fx.registry.close_all_unreferenced();

        let second = fx.open(id, Ttl::from_secs(5));
        assert!(stale.is_retired());
        assert!(!second.is_retired());
        assert_eq!(second.get(), 1);
    }

    // ---- Directory store ----

    #[test]
    fn directory_store_reopens_across_registries() {
        let dir = tempfile::tempdir().unwrap();
        let id = DurableId::new();
        let discarded = Arc::new(AtomicUsize::new(0));
        {
            let registry = Registry::new(
                RegistryConfig::default(),
                Arc::new(DirBackingStore::open(dir.path()).unwrap()),
            );
            let counter = registry
                .open_or_create(id, Ttl::from_secs(60), |origin| Counter::build(origin, &discarded))
                .unwrap();
            counter.bump();
            counter.bump();
            drop(counter);
            assert!(registry.is_cached(&id));
            assert_eq!(registry.is_on_disk(&id), Some(true));
        }

        let registry = Registry::new(
            RegistryConfig::default(),
            Arc::new(DirBackingStore::open(dir.path()).unwrap()),
        );
        assert!(registry.store().can_load(&id).unwrap());
        let counter = registry
            .force_open(id, |body| Counter::build(Origin::Loaded(body), &discarded))
            .unwrap();
        assert_eq!(counter.get(), 2);
        assert_eq!(counter.ttl(), Ttl::from_secs(60));
        drop(counter);

        let report = registry.clean(Deadline::now().after(Ttl::from_secs(120))).unwrap();
        assert_eq!(report.evicted, vec![id]);
        assert_eq!(report.purged, vec![id]);
        assert!(!registry.store().can_load(&id).unwrap());
        assert_eq!(discarded.load(Ordering::SeqCst), 1);
    }

    // ---- Clean / destroy ----

    #[test]
    fn clean_destroys_expired_only() {
        let fx = Fixture::new(10);
        let short = DurableId::new();
        let long = DurableId::new();
        let open = DurableId::new();
        drop(fx.open(short, Ttl::from_secs(1)));
        drop(fx.open(long, Ttl::from_secs(60)));
        // An open durable whose stored record has expired keeps its slot.
        drop(fx.open(open, Ttl::from_secs(1)));
        let keep = fx.open(open, Ttl::from_secs(1));

        let report = fx.registry.clean(Deadline::now().after(Ttl::from_secs(2))).unwrap();
        assert_eq!(report.evicted, vec![short]);
        assert_eq!(report.purged, vec![short]);
        assert!(!fx.registry.is_openable(&short));
        assert!(fx.registry.is_cached(&long));
        assert!(fx.registry.is_openable(&open));
        assert_eq!(fx.discarded.load(Ordering::SeqCst), 1);
        drop(keep);
    }

    #[test]
    fn destroy_requires_zero_count() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        drop(fx.open(id, Ttl::from_secs(5)));
        assert!(fx.registry.destroy(&id));
        assert!(!fx.registry.destroy(&id));
    }

    #[test]
    #[should_panic(expected = "live handles")]
    fn destroy_with_live_handle_panics() {
        let fx = Fixture::new(10);
        let id = DurableId::new();
        let handle = fx.open(id, Ttl::from_secs(5));
        std::mem::forget(handle);
        fx.registry.destroy(&id);
    }

    #[test]
    fn close_all_unreferenced_empties_cache() {
        let fx = Fixture::new(10);
        let kept = fx.open(DurableId::new(), Ttl::from_secs(5));
        for _ in 0..3 {
            drop(fx.open(DurableId::new(), Ttl::from_secs(5)));
        }
        assert_eq!(fx.registry.cached_len(), 3);
        assert_eq!(fx.registry.close_all_unreferenced(), 3);
        assert_eq!(fx.registry.cached_len(), 0);
        assert_eq!(fx.registry.openable_len(), 1);
        assert_eq!(kept.ref_count(), 1);
    }

    #[test]
    fn clear_after_all_handles_dropped() {
        let fx = Fixture::new(10);
        drop(fx.open(DurableId::new(), Ttl::from_secs(5)));
        fx.registry.clear();
        assert_eq!(fx.registry.openable_len(), 0);
    }
}
