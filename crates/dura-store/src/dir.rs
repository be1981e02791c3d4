use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use dura_types::{Deadline, DurableId, Ttl};
use tracing::{debug, warn};

use crate::completion::Completion;
use crate::error::{StoreError, StoreResult};
use crate::frame::{read_framed_file, write_framed_file};
use crate::record::StoredDurable;
use crate::traits::BackingStore;

const RECORD_EXTENSION: &str = "rec";

/// Latest accepted request per id that the writer has not applied yet.
struct Pending {
    ticket: u64,
    op: PendingOp,
}

enum PendingOp {
    Save(StoredDurable),
    Delete,
}

#[derive(Default)]
struct Overlay {
    next_ticket: u64,
    pending: HashMap<DurableId, Pending>,
}

impl Overlay {
    fn stage(&mut self, id: DurableId, op: PendingOp) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.pending.insert(id, Pending { ticket, op });
        ticket
    }

    /// Forget the staged request once the writer has applied it, unless a
    /// newer request for the same id has been staged since.
    fn settle(&mut self, id: &DurableId, ticket: u64) {
        if self.pending.get(id).is_some_and(|p| p.ticket == ticket) {
            self.pending.remove(id);
        }
    }
}

enum Command {
    Save {
        record: StoredDurable,
        ticket: u64,
        done: Completion,
    },
    Delete {
        id: DurableId,
        ticket: u64,
        done: Completion,
    },
    Clean {
        now: Deadline,
        done: Completion<Vec<DurableId>>,
    },
}

/// Directory-backed store: one framed record file per durable.
///
/// Saves and deletes are staged in an in-memory overlay and applied in
/// submission order by a background writer thread, which pushes each
/// request's completion after the file system operation finishes. Loads
/// consult the overlay first so they never see a stale file.
///
/// Directory layout:
/// ```text
/// <root>/<durable-id>.rec    framed bincode StoredDurable
/// ```
pub struct DirBackingStore {
    root: PathBuf,
    overlay: Arc<Mutex<Overlay>>,
    commands: Mutex<Option<Sender<Command>>>,
    writer: Option<JoinHandle<()>>,
}

impl DirBackingStore {
    /// Open (or create) a store rooted at `root` and start its writer.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let overlay = Arc::new(Mutex::new(Overlay::default()));
        let (tx, rx) = mpsc::channel();

        let writer_root = root.to_path_buf();
        let writer_overlay = Arc::clone(&overlay);
        let writer = thread::Builder::new()
            .name("dura-store-writer".into())
            .spawn(move || writer_loop(&writer_root, &writer_overlay, rx))?;

        Ok(Self {
            root: root.to_path_buf(),
            overlay,
            commands: Mutex::new(Some(tx)),
            writer: Some(writer),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of requests accepted but not yet applied by the writer.
    pub fn pending_len(&self) -> usize {
        self.overlay.lock().expect("lock poisoned").pending.len()
    }

    /// Stop accepting requests, drain the writer, and join it.
    pub fn shutdown(&mut self) {
        self.commands.lock().expect("lock poisoned").take();
        if let Some(handle) = self.writer.take() {
            if handle.join().is_err() {
                warn!(root = %self.root.display(), "store writer panicked");
            }
        }
    }

    fn submit(&self, command: Command) -> StoreResult<()> {
        let commands = self.commands.lock().expect("lock poisoned");
        let tx = commands.as_ref().ok_or(StoreError::Closed)?;
        tx.send(command).map_err(|_| StoreError::Closed)
    }
}

impl BackingStore for DirBackingStore {
    fn can_load(&self, id: &DurableId) -> StoreResult<bool> {
        if let Some(pending) = self.overlay.lock().expect("lock poisoned").pending.get(id) {
            return Ok(matches!(pending.op, PendingOp::Save(_)));
        }
        Ok(record_path(&self.root, id).exists())
    }

    fn try_load(&self, id: &DurableId) -> StoreResult<Option<Vec<u8>>> {
        if let Some(pending) = self.overlay.lock().expect("lock poisoned").pending.get(id) {
            return Ok(match &pending.op {
                PendingOp::Save(record) => Some(record.blob.clone()),
                PendingOp::Delete => None,
            });
        }
        match read_record(&record_path(&self.root, id)) {
            Ok(record) if record.id == *id => Ok(Some(record.blob)),
            Ok(record) => Err(StoreError::CorruptRecord {
                id: *id,
                reason: format!("file holds record for {}", record.id),
            }),
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
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
        let mut overlay = self.overlay.lock().expect("lock poisoned");
        let ticket = overlay.stage(*id, PendingOp::Save(record.clone()));
        let submitted = self.submit(Command::Save { record, ticket, done });
        if submitted.is_err() {
            overlay.settle(id, ticket);
        }
        submitted
    }

    fn delete(&self, id: &DurableId, done: Completion) -> StoreResult<()> {
        let mut overlay = self.overlay.lock().expect("lock poisoned");
        let ticket = overlay.stage(*id, PendingOp::Delete);
        let submitted = self.submit(Command::Delete { id: *id, ticket, done });
        if submitted.is_err() {
            overlay.settle(id, ticket);
        }
        submitted
    }

    fn clean_disk(&self, now: Deadline, done: Completion<Vec<DurableId>>) -> StoreResult<()> {
        self.submit(Command::Clean { now, done })
    }
}

impl Drop for DirBackingStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DirBackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirBackingStore")
            .field("root", &self.root)
            .field("pending", &self.pending_len())
            .finish()
    }
}

fn record_path(root: &Path, id: &DurableId) -> PathBuf {
    root.join(format!("{id}.{RECORD_EXTENSION}"))
}

fn read_record(path: &Path) -> StoreResult<StoredDurable> {
    let payload = read_framed_file(path)?;
    StoredDurable::decode(&payload)
}

fn writer_loop(root: &Path, overlay: &Mutex<Overlay>, rx: Receiver<Command>) {
    // Runs until every sender is gone, which drains the queue first.
    for command in rx {
        match command {
            Command::Save { record, ticket, done } => {
                let id = record.id;
                let result = record
                    .encode()
                    .and_then(|payload| write_framed_file(&record_path(root, &id), &payload));
                debug!(id = %id, ok = result.is_ok(), "record saved");
                overlay.lock().expect("lock poisoned").settle(&id, ticket);
                done.push(result);
            }
            Command::Delete { id, ticket, done } => {
                let result = match fs::remove_file(record_path(root, &id)) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                };
                debug!(id = %id, ok = result.is_ok(), "record deleted");
                overlay.lock().expect("lock poisoned").settle(&id, ticket);
                done.push(result);
            }
            Command::Clean { now, done } => done.push(purge_expired(root, now)),
        }
    }
}

fn purge_expired(root: &Path, now: Deadline) -> StoreResult<Vec<DurableId>> {
    let mut purged = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
            continue;
        }
        let record = match read_record(&path) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable record");
                continue;
            }
        };
        if record.is_expired(now) {
            fs::remove_file(&path)?;
            purged.push(record.id);
        }
    }
    purged.sort();
    debug!(count = purged.len(), now = %now, "expired records purged");
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn save(store: &DirBackingStore, id: DurableId, deadline_ms: u64, blob: &[u8]) -> Completion {
        let done = Completion::new();
        store
            .save(&id, Deadline::from_millis(deadline_ms), Ttl::from_secs(1), blob.to_vec(), done.clone())
            .unwrap();
        done
    }

    #[test]
    fn save_is_visible_before_and_after_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBackingStore::open(dir.path()).unwrap();
        let id = DurableId::new();

        let done = save(&store, id, 100, b"state");
        // Staged saves are visible immediately.
        assert!(store.can_load(&id).unwrap());
        done.wait().unwrap();

        assert_eq!(store.pending_len(), 0);
        assert!(dir.path().join(format!("{id}.rec")).exists());
        assert_eq!(store.try_load(&id).unwrap().unwrap(), b"state");
    }

    #[test]
    fn delete_hides_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBackingStore::open(dir.path()).unwrap();
        let id = DurableId::new();
        save(&store, id, 100, b"state").wait().unwrap();

        let done = Completion::new();
        store.delete(&id, done.clone()).unwrap();
        assert!(!store.can_load(&id).unwrap());
        done.wait().unwrap();
        assert!(store.try_load(&id).unwrap().is_none());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = DurableId::new();
        {
            let store = DirBackingStore::open(dir.path()).unwrap();
            save(&store, id, 100, b"persisted").wait().unwrap();
        }
        let store = DirBackingStore::open(dir.path()).unwrap();
        assert_eq!(store.try_load(&id).unwrap().unwrap(), b"persisted");
    }

    #[test]
    fn open_creates_nested_root() {
        let dir = tempfile::tempdir().unwrap();
        let root: PathBuf = dir.path().join("data").join("durables");
        let store = DirBackingStore::open(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
        drop(store);
        assert!(DirBackingStore::open(root).is_ok());
    }

    #[test]
    fn clean_disk_runs_after_earlier_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBackingStore::open(dir.path()).unwrap();
        let early = DurableId::from_u128(1);
        let late = DurableId::from_u128(2);
        let a = save(&store, early, 100, b"a");
        let b = save(&store, late, 500, b"b");

        let done = Completion::new();
        store.clean_disk(Deadline::from_millis(200), done.clone()).unwrap();
        assert_eq!(done.wait().unwrap(), vec![early]);
        a.wait().unwrap();
        b.wait().unwrap();
        assert!(!store.can_load(&early).unwrap());
        assert!(store.can_load(&late).unwrap());
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBackingStore::open(dir.path()).unwrap();
        let id = DurableId::new();
        fs::write(dir.path().join(format!("{id}.rec")), b"garbage!").unwrap();
        assert!(store.try_load(&id).is_err());
    }

    #[test]
    fn closed_store_rejects_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirBackingStore::open(dir.path()).unwrap();
        store.shutdown();
        let id = DurableId::new();
        let done = Completion::new();
        let err = store
            .save(&id, Deadline::EPOCH, Ttl::ZERO, vec![], done.clone())
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed));
        assert!(!done.is_done());
        assert!(!store.can_load(&id).unwrap());
    }
}
