use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dura_types::{DurableId, SeqRange};

use crate::error::RepoResult;
use crate::files::{FileMeta, LayerFiles};
use crate::removal::RemovalQueue;
use crate::update::Update;

/// Process-wide layer number, assigned by the [`RemovalQueue`].
pub type LayerId = u64;

/// Where a layer's updates live.
#[derive(Debug)]
pub enum LayerSource {
    Mem(Vec<Update>),
    File(FileMeta),
}

/// An immutable run of updates covering one sequence range.
///
/// A layer counts the mapping entries that reference it. It becomes
/// eligible for removal once it is *taken* (claimed by a merge or by its
/// repository's teardown) and that count is zero; the removal queue then
/// receives it exactly once.
pub struct DataLayer {
    id: LayerId,
    owner: DurableId,
    range: SeqRange,
    source: LayerSource,
    ref_count: AtomicUsize,
    taken: AtomicBool,
    marked_for_removal: AtomicBool,
    queued: AtomicBool,
    reclaimed: AtomicBool,
    removal: Arc<RemovalQueue>,
}

impl DataLayer {
    fn build(
        owner: DurableId,
        range: SeqRange,
        source: LayerSource,
        removal: &Arc<RemovalQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: removal.next_layer_id(),
            owner,
            range,
            source,
            ref_count: AtomicUsize::new(0),
            taken: AtomicBool::new(false),
            marked_for_removal: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            reclaimed: AtomicBool::new(false),
            removal: Arc::clone(removal),
        })
    }

    /// A layer holding `updates` in memory. `updates` must be in sequence
    /// order within `range`.
    pub fn new_mem(
        owner: DurableId,
        range: SeqRange,
        updates: Vec<Update>,
        removal: &Arc<RemovalQueue>,
    ) -> Arc<Self> {
        debug_assert!(updates.iter().all(|u| range.contains(u.seq)));
        Self::build(owner, range, LayerSource::Mem(updates), removal)
    }

    /// A layer backed by a layer file.
    pub fn new_file(owner: DurableId, meta: FileMeta, removal: &Arc<RemovalQueue>) -> Arc<Self> {
        let range = meta.range;
        Self::build(owner, range, LayerSource::File(meta), removal)
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn owner(&self) -> DurableId {
        self.owner
    }

    pub fn range(&self) -> SeqRange {
        self.range
    }

    pub fn source(&self) -> &LayerSource {
        &self.source
    }

    pub fn is_mem(&self) -> bool {
        matches!(self.source, LayerSource::Mem(_))
    }

    pub fn file_meta(&self) -> Option<&FileMeta> {
        match &self.source {
            LayerSource::File(meta) => Some(meta),
            LayerSource::Mem(_) => None,
        }
    }

    /// Number of updates in the layer.
    pub fn size(&self) -> usize {
        match &self.source {
            LayerSource::Mem(updates) => updates.len(),
            LayerSource::File(meta) => meta.num_updates,
        }
    }

    /// Every update of the layer, reading the file if needed.
    pub fn updates(&self, files: &dyn LayerFiles) -> RepoResult<Vec<Update>> {
        match &self.source {
            LayerSource::Mem(updates) => Ok(updates.clone()),
            LayerSource::File(meta) => files.read_file(&self.owner, meta.gen_id),
        }
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::SeqCst)
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.marked_for_removal.load(Ordering::SeqCst)
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::SeqCst)
    }

    /// Count one more mapping entry.
    ///
    /// # Panics
    ///
    /// If the layer is already queued for removal, or is taken with no
    /// references left.
    pub fn attach(&self) {
        assert!(!self.is_queued(), "attaching layer {} queued for removal", self.id);
        let previous = self.ref_count.fetch_add(1, Ordering::SeqCst);
        assert!(
            previous > 0 || !self.is_taken(),
            "attaching taken layer {} with no references",
            self.id
        );
    }

    /// Drop one mapping entry; the last one of a taken layer queues it.
    pub fn detach(this: &Arc<Self>) {
        let previous = this.ref_count.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "layer {} detached more than attached", this.id);
        if previous == 1 {
            this.removal.offer(this);
        }
    }

    /// Claim the layer for a merge. Returns `false` if it is already taken.
    pub fn try_take(&self) -> bool {
        self.taken
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Mark the layer taken for teardown, queueing it now if unreferenced.
    pub fn mark_taken(this: &Arc<Self>) {
        this.removal.take(this);
    }

    /// Give back a merge claim that did not replace the layer.
    pub fn unmark_taken(&self) {
        self.taken.store(false, Ordering::SeqCst);
    }

    /// The layer was replaced; its file (if any) is deleted on reclaim.
    pub fn mark_for_removal(&self) {
        self.marked_for_removal.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_taken(&self) {
        self.taken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_queued(&self) {
        self.queued.store(true, Ordering::SeqCst);
    }

    /// Returns `true` the first time only.
    pub(crate) fn set_reclaimed(&self) -> bool {
        !self.reclaimed.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for DataLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLayer")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("range", &self.range)
            .field("mem", &self.is_mem())
            .field("ref_count", &self.ref_count())
            .field("taken", &self.is_taken())
            .finish()
    }
}
