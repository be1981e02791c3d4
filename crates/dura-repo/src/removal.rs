//! Deferred reclamation of data layers.
//!
//! Layers that are taken and unreferenced land in the [`RemovalQueue`],
//! ordered by layer id. A background [`LayerCleaner`] sweeps it; reclaiming
//! a layer that was replaced deletes its file.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RepoResult;
use crate::files::LayerFiles;
use crate::layer::{DataLayer, LayerId};

/// Tuning for layer reclamation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemovalConfig {
    /// How often the cleaner sweeps the removal queue.
    pub cleaner_interval_ms: u64,
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            cleaner_interval_ms: 100,
        }
    }
}

impl RemovalConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.cleaner_interval_ms)
    }
}

/// Layers awaiting reclamation, keyed by id.
pub struct RemovalQueue {
    members: Mutex<BTreeMap<LayerId, Arc<DataLayer>>>,
    files: Arc<dyn LayerFiles>,
    next_layer_id: AtomicU64,
    next_gen_id: AtomicU64,
    reclaimed: AtomicUsize,
}

impl RemovalQueue {
    pub fn new(files: Arc<dyn LayerFiles>) -> Self {
        Self {
            members: Mutex::new(BTreeMap::new()),
            files,
            next_layer_id: AtomicU64::new(1),
            next_gen_id: AtomicU64::new(1),
            reclaimed: AtomicUsize::new(0),
        }
    }

    pub fn next_layer_id(&self) -> LayerId {
        self.next_layer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Generation id for a new layer file. Unique across every repository
    /// sharing this queue, so a queued file of a discarded repository never
    /// names a file of a later repository with the same id.
    pub fn next_gen_id(&self) -> u64 {
        self.next_gen_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Keep future generation ids above `gen_id`, one found on storage.
    pub fn observe_gen_id(&self, gen_id: u64) {
        self.next_gen_id.fetch_max(gen_id.saturating_add(1), Ordering::Relaxed);
    }

    /// Queue `layer` if it is taken, unreferenced, and not yet queued.
    pub(crate) fn offer(&self, layer: &Arc<DataLayer>) {
        let mut members = self.members.lock().expect("lock poisoned");
        Self::admit(&mut members, layer);
    }

    /// Mark `layer` taken and queue it if it is already unreferenced.
    pub(crate) fn take(&self, layer: &Arc<DataLayer>) {
        let mut members = self.members.lock().expect("lock poisoned");
        layer.set_taken();
        Self::admit(&mut members, layer);
    }

    fn admit(members: &mut BTreeMap<LayerId, Arc<DataLayer>>, layer: &Arc<DataLayer>) {
        if layer.is_taken() && layer.ref_count() == 0 && !layer.is_queued() {
            layer.set_queued();
            members.insert(layer.id(), Arc::clone(layer));
        }
    }

    /// Reclaim every queued layer, lowest id first. Returns how many were
    /// reclaimed.
    pub fn sweep(&self) -> usize {
        let mut swept = 0;
        loop {
            let next = self
                .members
                .lock()
                .expect("lock poisoned")
                .pop_first()
                .map(|(_, layer)| layer);
            let Some(layer) = next else {
                break;
            };
            self.reclaim(&layer);
            swept += 1;
        }
        if swept > 0 {
            debug!(swept, "swept removal queue");
        }
        swept
    }

    fn reclaim(&self, layer: &DataLayer) {
        assert!(layer.set_reclaimed(), "layer {} removed twice", layer.id());
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        if !layer.is_marked_for_removal() {
            return;
        }
        if let Some(meta) = layer.file_meta() {
            if let Err(e) = self.files.remove_file(&layer.owner(), meta.gen_id) {
                warn!(
                    owner = %layer.owner(),
                    gen_id = meta.gen_id,
                    error = %e,
                    "failed to remove layer file"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total layers reclaimed since creation.
    pub fn reclaimed_count(&self) -> usize {
        self.reclaimed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RemovalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalQueue")
            .field("len", &self.len())
            .field("reclaimed", &self.reclaimed_count())
            .finish()
    }
}

// ---- Cleaner ----

#[derive(Default)]
struct Stop {
    requested: Mutex<bool>,
    cond: Condvar,
}

/// Background thread sweeping a [`RemovalQueue`] on an interval.
pub struct LayerCleaner {
    stop: Arc<Stop>,
    join: Option<JoinHandle<()>>,
}

impl LayerCleaner {
    pub fn start(queue: Arc<RemovalQueue>, interval: Duration) -> RepoResult<Self> {
        let stop = Arc::new(Stop::default());
        let signal = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("dura-layer-cleaner".to_string())
            .spawn(move || loop {
                queue.sweep();
                let requested = signal.requested.lock().expect("lock poisoned");
                let (requested, _) = signal
                    .cond
                    .wait_timeout_while(requested, interval, |stopped| !*stopped)
                    .expect("lock poisoned");
                if *requested {
                    break;
                }
            })?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        *self.stop.requested.lock().expect("lock poisoned") = true;
        self.stop.cond.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for LayerCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}
