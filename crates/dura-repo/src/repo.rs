//! Layered, mergeable repositories.
//!
//! A [`Repo`] appends sequenced updates to an in-memory tail. The memory
//! merge step turns the tail into layers and folds trailing memory layers
//! together; in a safe repo it writes them out as layer files, which the
//! disk merge step then folds pairwise by size bucket. Every step publishes
//! a fresh [`Mapping`], so readers holding a [`RepoView`] are never
//! disturbed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use dura_durable::{Durable, DurableError, DurableResult, Handle, Severed};
use dura_merge::{Lane, MergeError, MergeQueues, MergeResult, Mergeable};
use dura_types::{DurableId, SeqNum, SeqRange};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RepoError, RepoResult};
use crate::files::{FileMeta, LayerFiles};
use crate::layer::{DataLayer, LayerId, LayerSource};
use crate::mapping::Mapping;
use crate::removal::RemovalQueue;
use crate::update::{merge_sorted, Update};

/// Size bucket of a layer: `floor(log2(max(size, 1)))`.
pub fn generation_for(size: usize) -> u32 {
    size.max(1).ilog2()
}

/// Services shared by every repository of one engine.
#[derive(Clone)]
pub struct RepoContext {
    pub queues: Arc<MergeQueues>,
    pub removal: Arc<RemovalQueue>,
    pub files: Arc<dyn LayerFiles>,
    pub locks: Arc<RepoLocks>,
}

impl RepoContext {
    fn disk_threshold(&self) -> usize {
        self.queues.config().disk_merge_threshold
    }
}

impl fmt::Debug for RepoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoContext")
            .field("removal", &self.removal)
            .finish_non_exhaustive()
    }
}

/// Merge step locks of one repository id.
#[derive(Default)]
pub struct StepLocks {
    mem: Mutex<()>,
    disk: Mutex<()>,
}

/// Step locks by repository id, shared by every instance of an id that is
/// still alive. A reloaded repository waits here for steps still running
/// on an instance the registry already dropped.
#[derive(Default)]
pub struct RepoLocks {
    by_id: Mutex<HashMap<DurableId, Weak<StepLocks>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The step locks of `id`, created if no live instance holds them.
    pub fn get(&self, id: DurableId) -> Arc<StepLocks> {
        let mut by_id = self.by_id.lock().expect("lock poisoned");
        if let Some(locks) = by_id.get(&id).and_then(Weak::upgrade) {
            return locks;
        }
        by_id.retain(|_, locks| locks.strong_count() > 0);
        let locks = Arc::new(StepLocks::default());
        by_id.insert(id, Arc::downgrade(&locks));
        locks
    }

    /// Ids whose step locks are still held.
    pub fn len(&self) -> usize {
        let by_id = self.by_id.lock().expect("lock poisoned");
        by_id.values().filter(|locks| locks.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a new repository is set up.
#[derive(Clone, Debug, Default)]
pub struct RepoOptions {
    /// Write layers out to layer files. Fast repositories stay in memory.
    pub safe: bool,
    /// Repository this one depends on; held open while this one is.
    pub parent: Option<Handle<Repo>>,
}

impl RepoOptions {
    pub fn safe() -> Self {
        Self {
            safe: true,
            parent: None,
        }
    }

    pub fn fast() -> Self {
        Self::default()
    }

    pub fn with_parent(mut self, parent: Handle<Repo>) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// State persisted in the repository's envelope. Layer files are listed
/// from storage instead.
#[derive(Serialize, Deserialize)]
struct RepoState {
    safe: bool,
    parent: Option<DurableId>,
    next_seq: SeqNum,
    released_up_to: SeqNum,
    pending: Vec<Update>,
}

struct Tail {
    current: Vec<Update>,
    next_seq: SeqNum,
    released_up_to: SeqNum,
}

struct Mappings {
    current: Arc<Mapping>,
    /// Superseded mappings still held by readers.
    older: Vec<Arc<Mapping>>,
}

impl Mappings {
    fn publish(&mut self, next: Mapping) {
        let previous = mem::replace(&mut self.current, Arc::new(next));
        self.older.push(previous);
        self.prune();
    }

    fn prune(&mut self) {
        self.older.retain(|mapping| Arc::strong_count(mapping) > 1);
    }
}

enum Fold {
    /// Leave the layers as they are.
    Keep,
    /// Swap the claimed layers for this one, or drop them outright.
    Replace(Option<Arc<DataLayer>>),
}

/// A versioned, mergeable data repository.
pub struct Repo {
    id: DurableId,
    me: Weak<Repo>,
    safe: bool,
    ctx: RepoContext,
    parent: Mutex<Option<Handle<Repo>>>,
    tail: Mutex<Tail>,
    mappings: Mutex<Mappings>,
    steps: Arc<StepLocks>,
    merge_times: Mutex<[Instant; 2]>,
    next_mapping: AtomicU64,
    /// Highest layer file generation this instance wrote or recovered.
    max_gen_id: AtomicU64,
    /// Set once the registry dropped this instance; merges stop.
    retired: AtomicBool,
}

fn lane_slot(lane: Lane) -> usize {
    match lane {
        Lane::Mem => 0,
        Lane::Disk => 1,
    }
}

fn is_disk_pair(lhs: &DataLayer, rhs: &DataLayer) -> bool {
    !lhs.is_mem() && !rhs.is_mem() && generation_for(lhs.size()) <= generation_for(rhs.size())
}

/// Layer files of `owner` that form a neighborly run. Files whose range is
/// contained in another file's range are leftovers of an interrupted merge
/// and are removed.
fn recover_files(owner: DurableId, files: &dyn LayerFiles) -> RepoResult<Vec<FileMeta>> {
    let mut metas = files.list_files(&owner)?;
    metas.sort_by(|a, b| {
        a.range
            .lowest
            .cmp(&b.range.lowest)
            .then(b.range.highest.cmp(&a.range.highest))
            .then(b.gen_id.cmp(&a.gen_id))
    });
    let mut kept: Vec<FileMeta> = Vec::with_capacity(metas.len());
    for meta in metas {
        match kept.last() {
            Some(last) if last.range.covers(&meta.range) => {
                debug!(owner = %owner, gen_id = meta.gen_id, range = %meta.range, "removing contained layer file");
                files.remove_file(&owner, meta.gen_id)?;
            }
            Some(last) if last.range.overlaps(&meta.range) => {
                return Err(RepoError::OverlappingFiles {
                    owner,
                    first: last.range,
                    second: meta.range,
                });
            }
            _ => kept.push(meta),
        }
    }
    Ok(kept)
}

impl Repo {
    fn build(
        id: DurableId,
        safe: bool,
        parent: Option<Handle<Repo>>,
        ctx: RepoContext,
        steps: Arc<StepLocks>,
        layers: Vec<Arc<DataLayer>>,
        tail: Tail,
    ) -> Arc<Self> {
        let now = Instant::now();
        let max_gen_id = layers
            .iter()
            .filter_map(|layer| layer.file_meta().map(|meta| meta.gen_id))
            .max()
            .unwrap_or(0);
        let current = Arc::new(Mapping::new(1, layers.iter()));
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            safe,
            ctx,
            parent: Mutex::new(parent),
            tail: Mutex::new(tail),
            mappings: Mutex::new(Mappings {
                current,
                older: Vec::new(),
            }),
            steps,
            merge_times: Mutex::new([now, now]),
            next_mapping: AtomicU64::new(2),
            max_gen_id: AtomicU64::new(max_gen_id),
            retired: AtomicBool::new(false),
        })
    }

    /// A fresh, empty repository.
    pub fn create(id: DurableId, options: RepoOptions, ctx: RepoContext) -> Arc<Self> {
        let tail = Tail {
            current: Vec::new(),
            next_seq: 1,
            released_up_to: 0,
        };
        let steps = ctx.locks.get(id);
        Self::build(id, options.safe, options.parent, ctx, steps, Vec::new(), tail)
    }

    /// Rebuild a repository from the state written by
    /// [`Durable::write_state`] and, for safe repositories, its layer files.
    ///
    /// `parent` receives the persisted parent id and returns the handle to
    /// hold, if any. Layer files are listed only after any step still
    /// running on an earlier instance of `id` has finished.
    pub fn restore(
        id: DurableId,
        body: &[u8],
        ctx: RepoContext,
        parent: impl FnOnce(Option<DurableId>) -> Option<Handle<Repo>>,
    ) -> RepoResult<Arc<Self>> {
        let state: RepoState =
            bincode::deserialize(body).map_err(|e| RepoError::Encoding(e.to_string()))?;
        let steps = ctx.locks.get(id);
        let metas = if state.safe {
            let _mem = steps.mem.lock().expect("lock poisoned");
            let _disk = steps.disk.lock().expect("lock poisoned");
            recover_files(id, &*ctx.files)?
        } else {
            Vec::new()
        };
        let highest = metas.last().map_or(0, |meta| meta.range.highest);
        if let Some(gen_id) = metas.iter().map(|meta| meta.gen_id).max() {
            ctx.removal.observe_gen_id(gen_id);
        }
        let pending: Vec<Update> = state
            .pending
            .into_iter()
            .filter(|update| update.seq > highest)
            .collect();
        let pending_highest = pending.last().map_or(0, |update| update.seq);
        let next_seq = state
            .next_seq
            .max(highest + 1)
            .max(pending_highest + 1)
            .max(1);
        let layers: Vec<Arc<DataLayer>> = metas
            .into_iter()
            .map(|meta| DataLayer::new_file(id, meta, &ctx.removal))
            .collect();
        debug!(
            repo = %id,
            files = layers.len(),
            pending = pending.len(),
            next_seq,
            "restored repo"
        );

        let has_pending = !pending.is_empty();
        let tail = Tail {
            current: pending,
            next_seq,
            released_up_to: state.released_up_to,
        };
        let repo = Self::build(id, state.safe, parent(state.parent), ctx, steps, layers, tail);
        if has_pending {
            repo.enqueue(Lane::Mem);
        }
        if repo.has_disk_work() {
            repo.enqueue(Lane::Disk);
        }
        Ok(repo)
    }

    fn lock_tail(&self) -> MutexGuard<'_, Tail> {
        self.tail.lock().expect("lock poisoned")
    }

    fn lock_mappings(&self) -> MutexGuard<'_, Mappings> {
        self.mappings.lock().expect("lock poisoned")
    }

    fn current(&self) -> Arc<Mapping> {
        Arc::clone(&self.lock_mappings().current)
    }

    pub fn id(&self) -> DurableId {
        self.id
    }

    pub fn is_safe(&self) -> bool {
        self.safe
    }

    pub fn parent_id(&self) -> Option<DurableId> {
        self.parent
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(Handle::id)
    }

    /// Sequence number the next append receives.
    pub fn next_seq(&self) -> SeqNum {
        self.lock_tail().next_seq
    }

    pub fn released_up_to(&self) -> SeqNum {
        self.lock_tail().released_up_to
    }

    /// Updates appended but not yet turned into a layer.
    pub fn tail_len(&self) -> usize {
        self.lock_tail().current.len()
    }

    // ---- Writes ----

    /// Append one update and return its sequence number. The first update
    /// into an empty tail schedules a memory merge.
    pub fn append_update(&self, ops: BTreeMap<String, Vec<u8>>) -> SeqNum {
        let (seq, was_empty) = {
            let mut tail = self.lock_tail();
            let seq = tail.next_seq;
            tail.next_seq += 1;
            let was_empty = tail.current.is_empty();
            tail.current.push(Update::new(seq, ops));
            (seq, was_empty)
        };
        if was_empty {
            self.enqueue(Lane::Mem);
        }
        seq
    }

    /// Append a single key/value put.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> SeqNum {
        let mut ops = BTreeMap::new();
        ops.insert(key.into(), value.into());
        self.append_update(ops)
    }

    /// Declare every update up to `seq` no longer needed. Merges drop them.
    pub fn release_up_to(&self, seq: SeqNum) {
        {
            let mut tail = self.lock_tail();
            let bound = seq.min(tail.next_seq - 1);
            tail.released_up_to = tail.released_up_to.max(bound);
        }
        if self.has_mem_work() {
            self.enqueue(Lane::Mem);
        }
    }

    // ---- Reads ----

    /// Snapshot of the newest mapping plus the unflushed tail.
    pub fn view(&self) -> RepoView {
        let tail = self.lock_tail();
        let mut mappings = self.lock_mappings();
        mappings.prune();
        RepoView {
            mapping: Arc::clone(&mappings.current),
            tail: tail.current.clone(),
            released_up_to: tail.released_up_to,
        }
    }

    pub fn layer_ranges(&self) -> Vec<SeqRange> {
        self.current().ranges()
    }

    pub fn layer_count(&self) -> usize {
        self.current().len()
    }

    pub fn disk_layer_count(&self) -> usize {
        self.current().layers().filter(|layer| !layer.is_mem()).count()
    }

    pub fn mem_layer_count(&self) -> usize {
        self.current().layers().filter(|layer| layer.is_mem()).count()
    }

    /// Number of superseded mappings still pinned by readers.
    pub fn retained_mappings(&self) -> usize {
        let mut mappings = self.lock_mappings();
        mappings.prune();
        mappings.older.len()
    }

    /// Every unreleased update in sequence order.
    pub fn read_all(&self) -> RepoResult<Vec<Update>> {
        self.view().read_all(&*self.ctx.files)
    }

    /// Latest value written for `key`.
    pub fn get(&self, key: &str) -> RepoResult<Option<Vec<u8>>> {
        let updates = self.read_all()?;
        Ok(updates
            .iter()
            .rev()
            .find_map(|update| update.get(key).map(<[u8]>::to_vec)))
    }

    // ---- Merging ----

    fn enqueue(&self, lane: Lane) {
        let target: Weak<dyn Mergeable> = self.me.clone();
        self.ctx.queues.enqueue(lane, self.id, target);
    }

    fn reschedule(&self) {
        if self.has_mem_work() {
            self.enqueue(Lane::Mem);
        }
        if self.has_disk_work() {
            self.enqueue(Lane::Disk);
        }
    }

    fn has_mem_work(&self) -> bool {
        let tail = self.lock_tail();
        if !tail.current.is_empty() {
            return true;
        }
        let current = Arc::clone(&self.lock_mappings().current);
        let run: Vec<&Arc<DataLayer>> = current
            .layers()
            .rev()
            .take_while(|layer| layer.is_mem() && !layer.is_taken())
            .collect();
        match run.as_slice() {
            [] => false,
            [layer] => self.safe || layer.range().highest <= tail.released_up_to,
            _ => true,
        }
    }

    fn has_disk_work(&self) -> bool {
        if !self.safe {
            return false;
        }
        let current = self.current();
        let layers: Vec<&Arc<DataLayer>> = current.layers().collect();
        let files = layers.iter().filter(|layer| !layer.is_mem()).count();
        files >= self.ctx.disk_threshold()
            && layers.windows(2).any(|pair| {
                is_disk_pair(pair[0], pair[1]) && !pair[0].is_taken() && !pair[1].is_taken()
            })
    }

    /// Publish a mapping without `old` and with `new`.
    fn replace(&self, old: &[Arc<DataLayer>], new: Option<Arc<DataLayer>>) {
        let removed: HashSet<LayerId> = old.iter().map(|layer| layer.id()).collect();
        let mut mappings = self.lock_mappings();
        let mut layers: Vec<Arc<DataLayer>> = mappings
            .current
            .layers()
            .filter(|layer| !removed.contains(&layer.id()))
            .cloned()
            .collect();
        layers.extend(new);
        let generation = self.next_mapping.fetch_add(1, Ordering::Relaxed);
        let next = Mapping::new(generation, layers.iter());
        for layer in old {
            layer.mark_for_removal();
        }
        mappings.publish(next);
    }

    /// Turn the tail into a memory layer.
    fn flush_tail(&self) {
        let mut tail = self.lock_tail();
        let range = match (tail.current.first(), tail.current.last()) {
            (Some(first), Some(last)) => SeqRange {
                lowest: first.seq,
                highest: last.seq,
            },
            _ => return,
        };
        let updates = mem::take(&mut tail.current);
        let layer = DataLayer::new_mem(self.id, range, updates, &self.ctx.removal);
        self.replace(&[], Some(layer));
    }

    fn write_layer(&self, range: SeqRange, updates: &[Update]) -> RepoResult<Arc<DataLayer>> {
        let gen_id = self.ctx.removal.next_gen_id();
        self.max_gen_id.fetch_max(gen_id, Ordering::SeqCst);
        let meta = self.ctx.files.write_file(&self.id, gen_id, range, updates)?;
        Ok(DataLayer::new_file(self.id, meta, &self.ctx.removal))
    }

    /// Claim the trailing run of untaken memory layers.
    fn claim_mem_run(&self) -> Vec<Arc<DataLayer>> {
        let current = self.current();
        let mut claimed = Vec::new();
        for layer in current.layers().rev() {
            if !layer.is_mem() || !layer.try_take() {
                break;
            }
            claimed.push(Arc::clone(layer));
        }
        claimed.reverse();
        claimed
    }

    fn fold_mem(&self, claimed: &[Arc<DataLayer>], released: SeqNum) -> RepoResult<Fold> {
        if let [layer] = claimed {
            if layer.range().highest <= released {
                return Ok(Fold::Replace(None));
            }
            if self.safe && layer.size() > 0 {
                let updates = layer.updates(&*self.ctx.files)?;
                return Ok(Fold::Replace(Some(self.write_layer(layer.range(), &updates)?)));
            }
            return Ok(Fold::Keep);
        }
        let Some(range) = claimed
            .iter()
            .map(|layer| layer.range())
            .reduce(|a, b| a.span(&b))
        else {
            return Ok(Fold::Keep);
        };
        let batches = claimed
            .iter()
            .map(|layer| layer.updates(&*self.ctx.files))
            .collect::<RepoResult<Vec<_>>>()?;
        let merged = merge_sorted(batches, released);
        if merged.is_empty() {
            return Ok(Fold::Replace(None));
        }
        if self.safe {
            return Ok(Fold::Replace(Some(self.write_layer(range, &merged)?)));
        }
        Ok(Fold::Replace(Some(DataLayer::new_mem(
            self.id,
            range,
            merged,
            &self.ctx.removal,
        ))))
    }

    /// One memory merge step.
    ///
    /// Flushes the tail, then folds the trailing memory layers: a lone layer
    /// is written out (safe) or dropped once fully released; several are
    /// merged by sequence number with released updates dropped.
    pub fn merge_mem(&self) -> RepoResult<()> {
        let _merging = self.steps.mem.lock().expect("lock poisoned");
        if self.is_retired() {
            return Ok(());
        }
        self.flush_tail();
        let claimed = self.claim_mem_run();
        if !claimed.is_empty() {
            let released = self.released_up_to();
            match self.fold_mem(&claimed, released) {
                Ok(Fold::Replace(layer)) => {
                    debug!(
                        repo = %self.id,
                        folded = claimed.len(),
                        replaced = layer.is_some(),
                        "merged memory layers"
                    );
                    self.replace(&claimed, layer);
                }
                Ok(Fold::Keep) => claimed.iter().for_each(|layer| layer.unmark_taken()),
                Err(e) => {
                    claimed.iter().for_each(|layer| layer.unmark_taken());
                    return Err(e);
                }
            }
        }
        self.reschedule();
        Ok(())
    }

    /// Claim the first neighbouring pair of file layers whose left bucket
    /// does not exceed the right one.
    fn claim_disk_pair(&self) -> Option<[Arc<DataLayer>; 2]> {
        let current = self.current();
        let layers: Vec<&Arc<DataLayer>> = current.layers().collect();
        for pair in layers.windows(2) {
            let (lhs, rhs) = (pair[0], pair[1]);
            if !is_disk_pair(lhs, rhs) || !lhs.try_take() {
                continue;
            }
            if !rhs.try_take() {
                lhs.unmark_taken();
                continue;
            }
            return Some([Arc::clone(lhs), Arc::clone(rhs)]);
        }
        None
    }

    /// One disk merge step with `budget` block slots. A no-op for fast
    /// repositories.
    pub fn merge_disk(&self, budget: usize) -> RepoResult<()> {
        if !self.safe {
            return Ok(());
        }
        let _merging = self.steps.disk.lock().expect("lock poisoned");
        if self.is_retired() {
            return Ok(());
        }
        if budget < 2 {
            debug!(repo = %self.id, budget, "disk merge skipped; budget too small");
            return Ok(());
        }
        let Some(pair) = self.claim_disk_pair() else {
            return Ok(());
        };
        let inputs: Vec<FileMeta> = pair
            .iter()
            .filter_map(|layer| layer.file_meta().cloned())
            .collect();
        let gen_id = self.ctx.removal.next_gen_id();
        self.max_gen_id.fetch_max(gen_id, Ordering::SeqCst);
        let released = self.released_up_to();
        match self
            .ctx
            .files
            .merge_files(&self.id, &inputs, gen_id, released, budget)
        {
            Ok(meta) => {
                debug!(repo = %self.id, gen_id, range = %meta.range, "merged layer files");
                let layer = DataLayer::new_file(self.id, meta, &self.ctx.removal);
                self.replace(&pair, Some(layer));
            }
            Err(e) => {
                pair.iter().for_each(|layer| layer.unmark_taken());
                return Err(e);
            }
        }
        self.reschedule();
        Ok(())
    }

    /// The registry dropped this instance; it no longer merges.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Remove the layer files this instance wrote or recovered. Files of a
    /// later instance of the same id have higher generations and stay.
    fn remove_own_files(&self) -> RepoResult<usize> {
        let fence = self.max_gen_id.load(Ordering::SeqCst);
        let mut removed = 0;
        for meta in self.ctx.files.list_files(&self.id)? {
            if meta.gen_id <= fence && self.ctx.files.remove_file(&self.id, meta.gen_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn encode_state(&self) -> RepoResult<Vec<u8>> {
        let parent = self.parent_id();
        let tail = self.lock_tail();
        let current = Arc::clone(&self.lock_mappings().current);
        let mut pending: Vec<Update> = Vec::new();
        for layer in current.layers() {
            if let LayerSource::Mem(updates) = layer.source() {
                pending.extend(updates.iter().cloned());
            }
        }
        pending.extend(tail.current.iter().cloned());
        pending.retain(|update| update.seq > tail.released_up_to);
        let state = RepoState {
            safe: self.safe,
            parent,
            next_seq: tail.next_seq,
            released_up_to: tail.released_up_to,
            pending,
        };
        bincode::serialize(&state).map_err(|e| RepoError::Encoding(e.to_string()))
    }
}

impl Durable for Repo {
    fn kind(&self) -> &'static str {
        "repo"
    }

    fn write_state(&self) -> DurableResult<Vec<u8>> {
        self.encode_state()
            .map_err(|e| DurableError::Encoding(e.to_string()))
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

    fn on_retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn on_discard(&self) {
        let _mem = self.steps.mem.lock().expect("lock poisoned");
        let _disk = self.steps.disk.lock().expect("lock poisoned");
        self.retired.store(true, Ordering::SeqCst);
        if !self.safe {
            return;
        }
        match self.remove_own_files() {
            Ok(removed) => debug!(repo = %self.id, removed, "removed layer files of discarded repo"),
            Err(e) => warn!(repo = %self.id, error = %e, "failed to remove layer files"),
        }
    }
}

impl Mergeable for Repo {
    fn merge_key(&self) -> DurableId {
        self.id
    }

    fn next_merge_time(&self, lane: Lane) -> Instant {
        self.merge_times.lock().expect("lock poisoned")[lane_slot(lane)]
    }

    fn set_next_merge_time(&self, lane: Lane, at: Instant) {
        self.merge_times.lock().expect("lock poisoned")[lane_slot(lane)] = at;
    }

    fn step_merge_mem(&self) -> MergeResult<()> {
        self.merge_mem()
            .map_err(|e| MergeError::step(Lane::Mem, self.id, e.to_string()))
    }

    fn step_merge_disk(&self, budget: usize) -> MergeResult<()> {
        self.merge_disk(budget)
            .map_err(|e| MergeError::step(Lane::Disk, self.id, e.to_string()))
    }
}

impl Drop for Repo {
    fn drop(&mut self) {
        let mappings = self
            .mappings
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let mut retained = mem::take(&mut mappings.older);
        retained.push(mem::replace(&mut mappings.current, Arc::new(Mapping::empty(0))));
        for mapping in &retained {
            for layer in mapping.layers() {
                DataLayer::mark_taken(layer);
            }
        }
    }
}

impl fmt::Debug for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repo")
            .field("id", &self.id)
            .field("safe", &self.safe)
            .field("layers", &self.layer_ranges())
            .finish()
    }
}

/// A consistent read snapshot of a repository.
#[derive(Clone, Debug)]
pub struct RepoView {
    mapping: Arc<Mapping>,
    tail: Vec<Update>,
    released_up_to: SeqNum,
}

impl RepoView {
    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn tail(&self) -> &[Update] {
        &self.tail
    }

    pub fn ranges(&self) -> Vec<SeqRange> {
        self.mapping.ranges()
    }

    /// Every unreleased update of the snapshot in sequence order.
    pub fn read_all(&self, files: &dyn LayerFiles) -> RepoResult<Vec<Update>> {
        let mut out = Vec::new();
        for layer in self.mapping.layers() {
            out.extend(layer.updates(files)?);
        }
        out.extend(self.tail.iter().cloned());
        out.retain(|update| update.seq > self.released_up_to);
        Ok(out)
    }
}
