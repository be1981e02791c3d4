//! Storage for the on-disk layers of safe repositories.
//!
//! A layer file holds the updates of one sequence range together with its
//! own metadata, so a repository can rebuild its mapping by listing files.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use dura_store::frame::{read_framed_file, write_framed_file};
use dura_types::{DurableId, SeqNum, SeqRange};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RepoError, RepoResult};
use crate::update::{merge_sorted, Update};

const LAYER_EXTENSION: &str = "layer";

/// Metadata of one layer file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Per-repository file number, unique and increasing.
    pub gen_id: u64,
    pub range: SeqRange,
    pub num_updates: usize,
}

#[derive(Serialize)]
struct LayerFileRef<'a> {
    meta: &'a FileMeta,
    updates: &'a [Update],
}

#[derive(Deserialize)]
struct LayerFile {
    meta: FileMeta,
    updates: Vec<Update>,
}

fn encode_layer(meta: &FileMeta, updates: &[Update]) -> RepoResult<Vec<u8>> {
    bincode::serialize(&LayerFileRef { meta, updates })
        .map_err(|e| RepoError::Encoding(e.to_string()))
}

fn decode_layer(bytes: &[u8]) -> RepoResult<LayerFile> {
    bincode::deserialize(bytes).map_err(|e| RepoError::Encoding(e.to_string()))
}

/// Where the layer files of safe repositories live.
///
/// Files are immutable once written. Removal is driven by the layer
/// removal queue, never by a merge itself.
pub trait LayerFiles: Send + Sync {
    /// Write `updates` as file `gen_id` of `owner` covering `range`.
    fn write_file(
        &self,
        owner: &DurableId,
        gen_id: u64,
        range: SeqRange,
        updates: &[Update],
    ) -> RepoResult<FileMeta>;

    /// Read back every update of a file.
    fn read_file(&self, owner: &DurableId, gen_id: u64) -> RepoResult<Vec<Update>>;

    /// Remove one file. Returns `false` if it was already gone.
    fn remove_file(&self, owner: &DurableId, gen_id: u64) -> RepoResult<bool>;

    /// Metadata of every file `owner` has, in no particular order.
    fn list_files(&self, owner: &DurableId) -> RepoResult<Vec<FileMeta>>;

    /// Remove every file of `owner`, returning how many were removed.
    fn remove_all(&self, owner: &DurableId) -> RepoResult<usize>;

    /// Merge `inputs` into a new file `out_gen` spanning all of them,
    /// dropping updates at or below `released_up_to`. Each input occupies
    /// one block slot of `budget`.
    fn merge_files(
        &self,
        owner: &DurableId,
        inputs: &[FileMeta],
        out_gen: u64,
        released_up_to: SeqNum,
        budget: usize,
    ) -> RepoResult<FileMeta> {
        if inputs.len() > budget {
            return Err(RepoError::OverBudget {
                inputs: inputs.len(),
                budget,
            });
        }
        let range = inputs
            .iter()
            .map(|meta| meta.range)
            .reduce(|a, b| a.span(&b))
            .ok_or(RepoError::NothingToMerge)?;
        let batches = inputs
            .iter()
            .map(|meta| self.read_file(owner, meta.gen_id))
            .collect::<RepoResult<Vec<_>>>()?;
        let merged = merge_sorted(batches, released_up_to);
        self.write_file(owner, out_gen, range, &merged)
    }
}

// ---- In-memory ----

/// Layer files held in memory as encoded bytes.
pub struct InMemoryLayerFiles {
    files: RwLock<HashMap<DurableId, BTreeMap<u64, Vec<u8>>>>,
    writes: AtomicUsize,
    removals: AtomicUsize,
}

impl InMemoryLayerFiles {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            removals: AtomicUsize::new(0),
        }
    }

    /// Number of files `owner` currently has.
    pub fn file_count(&self, owner: &DurableId) -> usize {
        self.files
            .read()
            .expect("lock poisoned")
            .get(owner)
            .map_or(0, BTreeMap::len)
    }

    /// Number of files across all owners.
    pub fn total_files(&self) -> usize {
        self.files
            .read()
            .expect("lock poisoned")
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn removal_count(&self) -> usize {
        self.removals.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryLayerFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryLayerFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLayerFiles")
            .field("total_files", &self.total_files())
            .finish()
    }
}

impl LayerFiles for InMemoryLayerFiles {
    fn write_file(
        &self,
        owner: &DurableId,
        gen_id: u64,
        range: SeqRange,
        updates: &[Update],
    ) -> RepoResult<FileMeta> {
        let meta = FileMeta {
            gen_id,
            range,
            num_updates: updates.len(),
        };
        let bytes = encode_layer(&meta, updates)?;
        self.files
            .write()
            .expect("lock poisoned")
            .entry(*owner)
            .or_default()
            .insert(gen_id, bytes);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(meta)
    }

    fn read_file(&self, owner: &DurableId, gen_id: u64) -> RepoResult<Vec<Update>> {
        let files = self.files.read().expect("lock poisoned");
        let bytes = files
            .get(owner)
            .and_then(|owned| owned.get(&gen_id))
            .ok_or(RepoError::FileNotFound {
                owner: *owner,
                gen_id,
            })?;
        Ok(decode_layer(bytes)?.updates)
    }

    fn remove_file(&self, owner: &DurableId, gen_id: u64) -> RepoResult<bool> {
        let mut files = self.files.write().expect("lock poisoned");
        let Some(owned) = files.get_mut(owner) else {
            return Ok(false);
        };
        let removed = owned.remove(&gen_id).is_some();
        if owned.is_empty() {
            files.remove(owner);
        }
        if removed {
            self.removals.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn list_files(&self, owner: &DurableId) -> RepoResult<Vec<FileMeta>> {
        let files = self.files.read().expect("lock poisoned");
        files
            .get(owner)
            .into_iter()
            .flat_map(BTreeMap::values)
            .map(|bytes| decode_layer(bytes).map(|file| file.meta))
            .collect()
    }

    fn remove_all(&self, owner: &DurableId) -> RepoResult<usize> {
        let removed = self
            .files
            .write()
            .expect("lock poisoned")
            .remove(owner)
            .map_or(0, |owned| owned.len());
        self.removals.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }
}

// ---- Directory ----

/// Layer files stored as framed files under `<root>/<owner>/`.
#[derive(Debug)]
pub struct DirLayerFiles {
    root: PathBuf,
}

impl DirLayerFiles {
    /// Open (creating if needed) a layer file directory.
    pub fn open(root: impl AsRef<Path>) -> RepoResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner: &DurableId) -> PathBuf {
        self.root.join(owner.to_string())
    }

    fn file_path(&self, owner: &DurableId, gen_id: u64) -> PathBuf {
        self.owner_dir(owner).join(format!("{gen_id:020}.{LAYER_EXTENSION}"))
    }

    fn layer_paths(&self, owner: &DurableId) -> RepoResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(self.owner_dir(owner)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == LAYER_EXTENSION) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

impl LayerFiles for DirLayerFiles {
    fn write_file(
        &self,
        owner: &DurableId,
        gen_id: u64,
        range: SeqRange,
        updates: &[Update],
    ) -> RepoResult<FileMeta> {
        let meta = FileMeta {
            gen_id,
            range,
            num_updates: updates.len(),
        };
        let bytes = encode_layer(&meta, updates)?;
        fs::create_dir_all(self.owner_dir(owner))?;
        write_framed_file(&self.file_path(owner, gen_id), &bytes)?;
        debug!(owner = %owner, gen_id, updates = updates.len(), "wrote layer file");
        Ok(meta)
    }

    fn read_file(&self, owner: &DurableId, gen_id: u64) -> RepoResult<Vec<Update>> {
        let path = self.file_path(owner, gen_id);
        if !path.exists() {
            return Err(RepoError::FileNotFound {
                owner: *owner,
                gen_id,
            });
        }
        let bytes = read_framed_file(&path)?;
        Ok(decode_layer(&bytes)?.updates)
    }

    fn remove_file(&self, owner: &DurableId, gen_id: u64) -> RepoResult<bool> {
        match fs::remove_file(self.file_path(owner, gen_id)) {
            Ok(()) => {
                debug!(owner = %owner, gen_id, "removed layer file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_files(&self, owner: &DurableId) -> RepoResult<Vec<FileMeta>> {
        self.layer_paths(owner)?
            .iter()
            .map(|path| -> RepoResult<FileMeta> {
                let bytes = read_framed_file(path)?;
                Ok(decode_layer(&bytes)?.meta)
            })
            .collect()
    }

    fn remove_all(&self, owner: &DurableId) -> RepoResult<usize> {
        let removed = self.layer_paths(owner)?.len();
        match fs::remove_dir_all(self.owner_dir(owner)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::put;

    fn range(lowest: SeqNum, highest: SeqNum) -> SeqRange {
        SeqRange::new(lowest, highest).unwrap()
    }

    fn exercise(files: &dyn LayerFiles) {
        let owner = DurableId::new();
        let a = files
            .write_file(&owner, 1, range(1, 2), &[put(1, "a", "1"), put(2, "a", "2")])
            .unwrap();
        let b = files
            .write_file(&owner, 2, range(3, 3), &[put(3, "b", "3")])
            .unwrap();
        assert_eq!(a.num_updates, 2);

        let mut listed = files.list_files(&owner).unwrap();
        listed.sort_by_key(|meta| meta.gen_id);
        assert_eq!(listed, vec![a.clone(), b.clone()]);

        let merged = files.merge_files(&owner, &[a, b], 3, 1, 16).unwrap();
        assert_eq!(merged.range, range(1, 3));
        let seqs: Vec<SeqNum> = files
            .read_file(&owner, 3)
            .unwrap()
            .iter()
            .map(|u| u.seq)
            .collect();
        assert_eq!(seqs, vec![2, 3]);

        assert!(files.remove_file(&owner, 1).unwrap());
        assert!(!files.remove_file(&owner, 1).unwrap());
        assert!(matches!(
            files.read_file(&owner, 1),
            Err(RepoError::FileNotFound { gen_id: 1, .. })
        ));
        assert_eq!(files.remove_all(&owner).unwrap(), 2);
        assert!(files.list_files(&owner).unwrap().is_empty());
    }

    // ---- Backends ----

    #[test]
    fn in_memory_files() {
        let files = InMemoryLayerFiles::new();
        exercise(&files);
        assert_eq!(files.write_count(), 3);
        assert_eq!(files.total_files(), 0);
    }

    #[test]
    fn dir_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = DirLayerFiles::open(dir.path().join("layers")).unwrap();
        exercise(&files);
    }

    // ---- Merge limits ----

    #[test]
    fn merge_over_budget_is_rejected() {
        let files = InMemoryLayerFiles::new();
        let owner = DurableId::new();
        let metas: Vec<FileMeta> = (1..=3)
            .map(|g| files.write_file(&owner, g, range(g, g), &[put(g, "k", "v")]).unwrap())
            .collect();
        assert!(matches!(
            files.merge_files(&owner, &metas, 9, 0, 2),
            Err(RepoError::OverBudget { inputs: 3, budget: 2 })
        ));
        assert!(matches!(
            files.merge_files(&owner, &[], 9, 0, 2),
            Err(RepoError::NothingToMerge)
        ));
    }

    #[test]
    fn dir_list_ignores_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let files = DirLayerFiles::open(dir.path()).unwrap();
        let owner = DurableId::new();
        files.write_file(&owner, 1, range(1, 1), &[put(1, "k", "v")]).unwrap();
        fs::write(dir.path().join(owner.to_string()).join("stray.tmp"), b"x").unwrap();
        assert_eq!(files.list_files(&owner).unwrap().len(), 1);
    }
}
