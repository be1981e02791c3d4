use std::sync::Arc;

use dura_durable::{CleanReport, DurableError, DurableResult, Handle, Origin, Registry};
use dura_merge::{MergeQueues, MergeScheduler};
use dura_store::{BackingStore, DirBackingStore, InMemoryBackingStore};
use dura_types::{Deadline, DurableId, Ttl};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{RepoError, RepoResult};
use crate::files::{DirLayerFiles, InMemoryLayerFiles, LayerFiles};
use crate::removal::{LayerCleaner, RemovalQueue};
use crate::repo::{Repo, RepoContext, RepoLocks, RepoOptions};

/// Owns everything repositories need: the registry, the merge workers, and
/// the layer cleaner.
///
/// Dropping the manager stops the workers and closes every unreferenced
/// repository. Handles that outlive it keep working but are no longer
/// merged.
pub struct RepoManager {
    config: EngineConfig,
    registry: Registry,
    scheduler: MergeScheduler,
    removal: Arc<RemovalQueue>,
    cleaner: LayerCleaner,
    files: Arc<dyn LayerFiles>,
    locks: Arc<RepoLocks>,
    shut_down: bool,
}

impl RepoManager {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn BackingStore>,
        files: Arc<dyn LayerFiles>,
    ) -> RepoResult<Self> {
        config.validate()?;
        let registry = Registry::new(config.registry.clone(), store);
        let scheduler = MergeScheduler::start(config.merge.clone())?;
        let removal = Arc::new(RemovalQueue::new(Arc::clone(&files)));
        let cleaner = LayerCleaner::start(Arc::clone(&removal), config.removal.interval())?;
        info!(
            max_cache_size = config.registry.max_cache_size,
            data_dir = ?config.data_dir,
            "repo manager started"
        );
        Ok(Self {
            config,
            registry,
            scheduler,
            removal,
            cleaner,
            files,
            locks: Arc::new(RepoLocks::new()),
            shut_down: false,
        })
    }

    /// A manager whose records and layer files live in memory.
    pub fn in_memory(config: EngineConfig) -> RepoResult<Self> {
        Self::new(
            config,
            Arc::new(InMemoryBackingStore::new()),
            Arc::new(InMemoryLayerFiles::new()),
        )
    }

    /// A manager persisting under `config.data_dir`.
    pub fn open(config: EngineConfig) -> RepoResult<Self> {
        let (Some(durables), Some(layers)) = (config.durables_dir(), config.layers_dir()) else {
            return Err(RepoError::Config("data_dir is not set".to_string()));
        };
        let store = Arc::new(DirBackingStore::open(durables)?);
        let files = Arc::new(DirLayerFiles::open(layers)?);
        Self::new(config, store, files)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn queues(&self) -> &Arc<MergeQueues> {
        self.scheduler.queues()
    }

    pub fn removal_queue(&self) -> &Arc<RemovalQueue> {
        &self.removal
    }

    pub fn files(&self) -> &Arc<dyn LayerFiles> {
        &self.files
    }

    fn context(&self) -> RepoContext {
        RepoContext {
            queues: Arc::clone(self.scheduler.queues()),
            removal: Arc::clone(&self.removal),
            files: Arc::clone(&self.files),
            locks: Arc::clone(&self.locks),
        }
    }

    fn restore(
        &self,
        id: DurableId,
        body: &[u8],
        parent: Option<Handle<Repo>>,
    ) -> DurableResult<Arc<Repo>> {
        Repo::restore(id, body, self.context(), |saved| {
            parent.or_else(|| {
                saved
                    .filter(|parent_id| *parent_id != id)
                    .and_then(|parent_id| self.open_parent(id, parent_id))
            })
        })
        .map_err(|e| DurableError::construct(id, e.to_string()))
    }

    fn open_parent(&self, child: DurableId, parent: DurableId) -> Option<Handle<Repo>> {
        match self.force_open_repo(parent) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(child = %child, parent = %parent, error = %e, "cannot reopen parent repo");
                None
            }
        }
    }

    /// Open `id`, loading it from the store or creating it with `options`.
    ///
    /// A loaded repository keeps its persisted flavour. Its parent is
    /// `options.parent` if given, otherwise the persisted parent reopened.
    pub fn open_or_create_repo(
        &self,
        id: DurableId,
        ttl: Ttl,
        options: RepoOptions,
    ) -> RepoResult<Handle<Repo>> {
        let handle = self.registry.open_or_create(id, ttl, |origin| match origin {
            Origin::New => Ok(Repo::create(id, options, self.context())),
            Origin::Loaded(body) => self.restore(id, body, options.parent),
        })?;
        Ok(handle)
    }

    /// Create `id`, failing if it is open, cached, or stored.
    pub fn create_repo(
        &self,
        id: DurableId,
        ttl: Ttl,
        options: RepoOptions,
    ) -> RepoResult<Handle<Repo>> {
        let handle = self
            .registry
            .create(id, ttl, || Ok(Repo::create(id, options, self.context())))?;
        Ok(handle)
    }

    /// Open `id`, which must already be openable or stored.
    pub fn force_open_repo(&self, id: DurableId) -> RepoResult<Handle<Repo>> {
        let handle = self
            .registry
            .force_open(id, |body| self.restore(id, body, None))?;
        Ok(handle)
    }

    /// Destroy expired repositories and purge expired records, removing the
    /// layer files of every purged id.
    pub fn clean(&self, now: Deadline) -> RepoResult<CleanReport> {
        let report = self.registry.clean(now)?;
        for id in &report.purged {
            match self.files.remove_all(id) {
                Ok(0) => {}
                Ok(removed) => debug!(repo = %id, removed, "removed layer files of purged repo"),
                Err(e) => warn!(repo = %id, error = %e, "failed to remove layer files"),
            }
        }
        Ok(report)
    }

    /// Close every repository nobody holds.
    ///
    /// Queued merges stay: the queues hold repositories weakly, and open
    /// repositories keep their scheduled work. The removal queue is swept
    /// before and after so layers released by the closes are reclaimed.
    pub fn close_all_unreferenced(&self) -> usize {
        self.removal.sweep();
        let closed = self.registry.close_all_unreferenced();
        self.removal.sweep();
        closed
    }

    /// Stop the merge workers and the cleaner, then close everything
    /// unreferenced. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.scheduler.shutdown();
        let closed = self.close_all_unreferenced();
        self.cleaner.stop();
        self.removal.sweep();
        info!(closed, "repo manager stopped");
    }
}

impl Drop for RepoManager {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for RepoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoManager")
            .field("openable", &self.registry.openable_len())
            .field("cached", &self.registry.cached_len())
            .field("removal", &self.removal)
            .finish()
    }
}
