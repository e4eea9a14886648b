//! File-backed store for persistent sync state.

use crate::backend::{ConflictHistoryStore, DeltaStore, QueueStore, SyncStateStore};
use crate::dir::{write_atomic, StoreDir};
use crate::error::{StorageError, StorageResult};
use crate::frame::{decode_frames, decode_payload, encode_frame, FrameKind};
use deltasync_protocol::{
    ConflictInfo, DeltaId, DeltaRecord, DeviceId, QueueItem, QueueItemId, SyncVersionState,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Options for opening a [`FileStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Create the directory if it does not exist.
    pub create_if_missing: bool,
    /// Call `sync_data` after every append.
    pub sync_on_write: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: true,
        }
    }
}

/// A persistent store implementing every store trait.
///
/// Append-only data (deltas, conflict history) lives in framed log files;
/// small mutable data (queue, watermarks) is rewritten atomically on every
/// change. All data is mirrored in memory, so reads never touch the disk.
///
/// # Recovery
///
/// A torn frame at the end of a log is truncated on open. A checksum
/// mismatch anywhere else in a log fails the open. An unreadable state file
/// does not: the store opens with an empty applied ledger and reports the
/// version states as corrupted until a new state is saved, so the engine
/// falls back to a full sync.
///
/// The highest appended version is kept in `meta.dat` whenever pruning
/// rewrites the delta log, so [`DeltaStore::latest_version`] never goes
/// backwards.
///
/// # Example
///
/// ```no_run
/// use deltasync_storage::{DeltaStore, FileStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("sync_store")).unwrap();
/// println!("latest version: {}", store.latest_version().unwrap());
/// ```
#[derive(Debug)]
pub struct FileStore {
    dir: StoreDir,
    options: StoreOptions,
    deltas: Mutex<AppendLog<DeltaRecord>>,
    conflicts: Mutex<AppendLog<ConflictInfo>>,
    queue: Mutex<Vec<QueueItem>>,
    state: Mutex<StateFile>,
    high_water: AtomicU64,
}

#[derive(Debug, Default)]
struct StateFile {
    states: BTreeMap<DeviceId, SyncVersionState>,
    applied: HashSet<DeltaId>,
    unreadable: Option<String>,
}

impl StateFile {
    fn unreadable(reason: String) -> Self {
        Self {
            unreadable: Some(reason),
            ..Self::default()
        }
    }

    fn check_readable(&self) -> StorageResult<()> {
        match &self.unreadable {
            Some(reason) => Err(StorageError::corrupted(format!("state file unreadable: {reason}"))),
            None => Ok(()),
        }
    }
}

impl FileStore {
    /// Opens or creates a store with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked or a log is corrupted.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Opens a store with explicit options.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing (and may not be
    /// created), locked, or a log is corrupted.
    pub fn open_with_options(path: &Path, options: StoreOptions) -> StorageResult<Self> {
        let dir = StoreDir::open(path, options.create_if_missing)?;
        let deltas: AppendLog<DeltaRecord> = AppendLog::open(dir.deltas_path(), FrameKind::Delta)?;
        let conflicts = AppendLog::open(dir.conflicts_path(), FrameKind::Conflict)?;
        let queue = load_queue_file(&dir.queue_path())?;
        let state = match load_state_file(&dir.state_path()) {
            Ok(state) => state,
            Err(e @ StorageError::Io(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "state file unreadable; version states dropped");
                StateFile::unreadable(e.to_string())
            }
        };
        let high_water = load_meta_file(&dir.meta_path())?.max(max_version(&deltas.records));

        Ok(Self {
            dir,
            options,
            deltas: Mutex::new(deltas),
            conflicts: Mutex::new(conflicts),
            queue: Mutex::new(queue),
            state: Mutex::new(state),
            high_water: AtomicU64::new(high_water),
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn persist_queue(&self, queue: &[QueueItem]) -> StorageResult<()> {
        let mut data = Vec::new();
        for item in queue {
            data.extend(encode_frame(FrameKind::QueueItem, item)?);
        }
        write_atomic(&self.dir.queue_path(), &data)
    }

    fn persist_state(&self, state: &StateFile) -> StorageResult<()> {
        let mut data = Vec::new();
        for version_state in state.states.values() {
            data.extend(encode_frame(FrameKind::VersionState, version_state)?);
        }
        let mut applied: Vec<DeltaId> = state.applied.iter().copied().collect();
        applied.sort();
        data.extend(encode_frame(FrameKind::AppliedIds, &applied)?);
        write_atomic(&self.dir.state_path(), &data)
    }

    fn persist_high_water(&self, version: u64) -> StorageResult<()> {
        write_atomic(&self.dir.meta_path(), &encode_frame(FrameKind::HighWater, &version)?)
    }
}

fn max_version(deltas: &[DeltaRecord]) -> u64 {
    deltas.iter().map(DeltaRecord::version).max().unwrap_or(0)
}

/// An append-only framed log mirrored in memory.
#[derive(Debug)]
struct AppendLog<T> {
    path: PathBuf,
    kind: FrameKind,
    file: File,
    len: u64,
    records: Vec<T>,
}

impl<T: Serialize + DeserializeOwned + Clone> AppendLog<T> {
    fn open(path: PathBuf, kind: FrameKind) -> StorageResult<Self> {
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let records = decode_records(&bytes, kind)?;
        let valid_len = records.1 as u64;

        let file = open_append(&path)?;
        if valid_len < bytes.len() as u64 {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            kind,
            file,
            len: valid_len,
            records: records.0,
        })
    }

    fn append_all(&mut self, items: &[T], sync: bool) -> StorageResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut data = Vec::new();
        for item in items {
            data.extend(encode_frame(self.kind, item)?);
        }

        let written = self.file.write_all(&data).and_then(|()| {
            if sync {
                self.file.sync_data()
            } else {
                self.file.flush()
            }
        });
        if let Err(e) = written {
            // Drop any partial frame so later appends stay aligned.
            let _ = self.file.set_len(self.len);
            return Err(e.into());
        }

        self.len += data.len() as u64;
        self.records.extend_from_slice(items);
        Ok(())
    }

    fn rewrite(&mut self, records: Vec<T>) -> StorageResult<()> {
        let mut data = Vec::new();
        for record in &records {
            data.extend(encode_frame(self.kind, record)?);
        }
        write_atomic(&self.path, &data)?;
        self.file = open_append(&self.path)?;
        self.len = data.len() as u64;
        self.records = records;
        Ok(())
    }
}

fn open_append(path: &Path) -> StorageResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?)
}

fn decode_records<T: DeserializeOwned>(bytes: &[u8], kind: FrameKind) -> StorageResult<(Vec<T>, usize)> {
    let decoded = decode_frames(bytes)?;
    let mut records = Vec::with_capacity(decoded.frames.len());
    for (frame_kind, payload) in decoded.frames {
        if frame_kind != kind {
            return Err(StorageError::corrupted(format!(
                "unexpected {frame_kind:?} frame, expected {kind:?}"
            )));
        }
        records.push(decode_payload(payload)?);
    }
    Ok((records, decoded.valid_len))
}

fn read_optional(path: &Path) -> StorageResult<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn load_queue_file(path: &Path) -> StorageResult<Vec<QueueItem>> {
    let bytes = read_optional(path)?;
    Ok(decode_records(&bytes, FrameKind::QueueItem)?.0)
}

fn load_meta_file(path: &Path) -> StorageResult<u64> {
    let bytes = read_optional(path)?;
    let decoded = decode_frames(&bytes)?;
    if decoded.valid_len < bytes.len() {
        return Err(StorageError::corrupted("meta file truncated"));
    }
    let mut high_water = 0;
    for (kind, payload) in decoded.frames {
        if kind != FrameKind::HighWater {
            return Err(StorageError::corrupted(format!(
                "unexpected {kind:?} frame in meta file"
            )));
        }
        high_water = high_water.max(decode_payload::<u64>(payload)?);
    }
    Ok(high_water)
}

fn load_state_file(path: &Path) -> StorageResult<StateFile> {
    let bytes = read_optional(path)?;
    let decoded = decode_frames(&bytes)?;
    if decoded.valid_len < bytes.len() {
        return Err(StorageError::corrupted("state file truncated"));
    }

    let mut state = StateFile::default();
    for (kind, payload) in decoded.frames {
        match kind {
            FrameKind::VersionState => {
                let version_state: SyncVersionState = decode_payload(payload)?;
                state.states.insert(version_state.device_id, version_state);
            }
            FrameKind::AppliedIds => {
                let ids: Vec<DeltaId> = decode_payload(payload)?;
                state.applied.extend(ids);
            }
            other => {
                return Err(StorageError::corrupted(format!(
                    "unexpected {other:?} frame in state file"
                )))
            }
        }
    }
    Ok(state)
}

impl DeltaStore for FileStore {
    fn bulk_append(&self, deltas: &[DeltaRecord]) -> StorageResult<()> {
        self.deltas
            .lock()
            .append_all(deltas, self.options.sync_on_write)?;
        self.high_water.fetch_max(max_version(deltas), Ordering::SeqCst);
        Ok(())
    }

    fn query_ordered_since(&self, since: u64) -> StorageResult<Vec<DeltaRecord>> {
        let mut result: Vec<DeltaRecord> = self
            .deltas
            .lock()
            .records
            .iter()
            .filter(|d| d.version() > since)
            .cloned()
            .collect();
        result.sort_by_key(|d| d.version());
        Ok(result)
    }

    fn latest_version(&self) -> StorageResult<u64> {
        Ok(self.high_water.load(Ordering::SeqCst))
    }

    fn delta_count(&self) -> StorageResult<usize> {
        Ok(self.deltas.lock().records.len())
    }

    fn prune_older_than(&self, cutoff_millis: u64) -> StorageResult<usize> {
        let mut log = self.deltas.lock();
        let keep: Vec<DeltaRecord> = log
            .records
            .iter()
            .filter(|d| d.timestamp() >= cutoff_millis)
            .cloned()
            .collect();
        let removed = log.records.len() - keep.len();
        if removed > 0 {
            self.persist_high_water(self.high_water.load(Ordering::SeqCst))?;
            log.rewrite(keep)?;
        }
        Ok(removed)
    }
}

impl QueueStore for FileStore {
    fn load_queue(&self) -> StorageResult<Vec<QueueItem>> {
        Ok(self.queue.lock().clone())
    }

    fn put_item(&self, item: &QueueItem) -> StorageResult<()> {
        let mut queue = self.queue.lock();
        let mut updated = queue.clone();
        match updated.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item.clone(),
            None => updated.push(item.clone()),
        }
        self.persist_queue(&updated)?;
        *queue = updated;
        Ok(())
    }

    fn remove_item(&self, id: QueueItemId) -> StorageResult<()> {
        let mut queue = self.queue.lock();
        if !queue.iter().any(|item| item.id == id) {
            return Ok(());
        }
        let updated: Vec<QueueItem> = queue.iter().filter(|item| item.id != id).cloned().collect();
        self.persist_queue(&updated)?;
        *queue = updated;
        Ok(())
    }

    fn clear_queue(&self) -> StorageResult<()> {
        let mut queue = self.queue.lock();
        self.persist_queue(&[])?;
        queue.clear();
        Ok(())
    }
}

impl SyncStateStore for FileStore {
    fn load_version_state(&self, device_id: DeviceId) -> StorageResult<Option<SyncVersionState>> {
        let current = self.state.lock();
        current.check_readable()?;
        Ok(current.states.get(&device_id).cloned())
    }

    fn version_states(&self) -> StorageResult<Vec<SyncVersionState>> {
        let current = self.state.lock();
        current.check_readable()?;
        Ok(current.states.values().cloned().collect())
    }

    fn save_version_state(&self, state: &SyncVersionState) -> StorageResult<()> {
        let mut current = self.state.lock();
        let previous = current.states.insert(state.device_id, state.clone());
        if let Err(e) = self.persist_state(&current) {
            match previous {
                Some(previous) => current.states.insert(state.device_id, previous),
                None => current.states.remove(&state.device_id),
            };
            return Err(e);
        }
        current.unreadable = None;
        Ok(())
    }

    fn clear_version_state(&self, device_id: DeviceId) -> StorageResult<()> {
        let mut current = self.state.lock();
        let Some(previous) = current.states.remove(&device_id) else {
            return Ok(());
        };
        if let Err(e) = self.persist_state(&current) {
            current.states.insert(device_id, previous);
            return Err(e);
        }
        Ok(())
    }

    fn is_applied(&self, id: DeltaId) -> StorageResult<bool> {
        Ok(self.state.lock().applied.contains(&id))
    }

    fn mark_applied(&self, ids: &[DeltaId]) -> StorageResult<()> {
        let mut current = self.state.lock();
        let added: Vec<DeltaId> = ids
            .iter()
            .copied()
            .filter(|id| current.applied.insert(*id))
            .collect();
        if added.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.persist_state(&current) {
            for id in &added {
                current.applied.remove(id);
            }
            return Err(e);
        }
        current.unreadable = None;
        Ok(())
    }

    fn applied_count(&self) -> StorageResult<usize> {
        Ok(self.state.lock().applied.len())
    }
}

impl ConflictHistoryStore for FileStore {
    fn append_conflict(&self, conflict: &ConflictInfo) -> StorageResult<()> {
        self.conflicts
            .lock()
            .append_all(std::slice::from_ref(conflict), self.options.sync_on_write)
    }

    fn conflict_history(&self) -> StorageResult<Vec<ConflictInfo>> {
        Ok(self.conflicts.lock().records.clone())
    }
}
