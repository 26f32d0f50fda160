//! Shared bookkeeping between the interception surface and the walker thread.
//!
//! Every file touched by either side gets one [`TrackedFile`] entry, found by
//! relative path. Each entry carries its own lock; the walker's chunk copies
//! and the interception replays for one file serialize on that lock and on
//! nothing else, so unrelated files never contend.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

/// Mutable state of one tracked file, guarded by the entry lock.
#[derive(Debug)]
pub struct FileState {
    /// Path relative to both roots. Renames relocate it.
    pub rel: PathBuf,
    /// Destination handle, opened on first need with the source file's mode.
    pub dest: Option<File>,
    /// How far the walker's linear copy has progressed.
    pub copied_up_to: u64,
    /// The walker finished this file (or will never visit it); every write
    /// must replay from now on.
    pub copy_done: bool,
    /// Unlinked or renamed away; replays and walker copies become no-ops.
    pub retired: bool,
    /// Open source descriptors referencing this entry.
    pub refs: usize,
}

impl FileState {
    /// A write at `off` needs replay when the walker already passed it.
    pub fn needs_replay(&self, off: u64) -> bool {
        self.copy_done || off < self.copied_up_to
    }

    /// Open (or return) the destination handle, creating parent directories
    /// and carrying the source file's permission bits over.
    pub fn dest_handle(&mut self, source_root: &Path, dest_root: &Path) -> io::Result<&File> {
        if self.dest.is_none() {
            let dest_path = dest_root.join(&self.rel);
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut opts = OpenOptions::new();
            opts.read(true).write(true).create(true);
            if let Ok(meta) = fs::metadata(source_root.join(&self.rel)) {
                opts.mode(meta.permissions().mode() & 0o777);
            }
            let file = opts.open(&dest_path)?;
            return Ok(self.dest.insert(file));
        }
        match self.dest.as_ref() {
            Some(file) => Ok(file),
            None => unreachable!("destination handle opened above"),
        }
    }
}

#[derive(Debug)]
pub struct TrackedFile {
    state: Mutex<FileState>,
}

impl TrackedFile {
    fn new(rel: &Path) -> Self {
        Self {
            state: Mutex::new(FileState {
                rel: rel.to_path_buf(),
                dest: None,
                copied_up_to: 0,
                copy_done: false,
                retired: false,
                refs: 0,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock()
    }
}

/// Path-keyed registry of tracked entries for one session.
#[derive(Debug, Default)]
pub struct FileMap {
    by_path: DashMap<PathBuf, Arc<TrackedFile>>,
}

impl FileMap {
    pub fn new() -> Self {
        Self {
            by_path: DashMap::new(),
        }
    }

    /// Find or create the entry for a relative path. Insertion is atomic, so
    /// a racing walker visit and intercepted open converge on one entry.
    pub fn get_or_insert(&self, rel: &Path) -> Arc<TrackedFile> {
        self.by_path
            .entry(rel.to_path_buf())
            .or_insert_with(|| Arc::new(TrackedFile::new(rel)))
            .clone()
    }

    pub fn get(&self, rel: &Path) -> Option<Arc<TrackedFile>> {
        self.by_path.get(rel).map(|e| e.clone())
    }

    /// Drop the path mapping, but only if it still points at `entry`; a
    /// concurrent re-open may already have replaced it.
    pub fn retire(&self, rel: &Path, entry: &Arc<TrackedFile>) {
        self.by_path.remove_if(rel, |_, v| Arc::ptr_eq(v, entry));
    }

    /// Re-key every entry under `old` to live under `new`, updating the
    /// entries' own paths in the same pass. Used when a rename moves a file
    /// or a whole directory while descriptors stay open on it.
    pub fn relocate_prefix(&self, old: &Path, new: &Path) {
        let moved: Vec<PathBuf> = self
            .by_path
            .iter()
            .filter(|e| e.key() == old || e.key().starts_with(old))
            .map(|e| e.key().clone())
            .collect();
        for key in moved {
            if let Some((_, entry)) = self.by_path.remove(&key) {
                let rel = match key.strip_prefix(old) {
                    Ok(tail) if tail.as_os_str().is_empty() => new.to_path_buf(),
                    Ok(tail) => new.join(tail),
                    Err(_) => continue,
                };
                entry.lock().rel = rel.clone();
                self.by_path.insert(rel, entry);
            }
        }
    }

    /// Retire every entry at or under `prefix` (unlink/rename-away of a
    /// whole subtree).
    pub fn retire_under(&self, prefix: &Path) {
        let doomed: Vec<PathBuf> = self
            .by_path
            .iter()
            .filter(|e| e.key() == prefix || e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in doomed {
            if let Some((_, entry)) = self.by_path.remove(&key) {
                let mut st = entry.lock();
                st.retired = true;
                st.dest = None;
            }
        }
    }

    /// Mark every entry at or under `prefix` as fully copied; used after a
    /// rename was mirrored by a full copy into a region the walker already
    /// passed.
    pub fn mark_copy_done_under(&self, prefix: &Path) {
        for e in self.by_path.iter() {
            if e.key() == prefix || e.key().starts_with(prefix) {
                e.value().lock().copy_done = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// One open descriptor handed out by the interception surface.
#[derive(Debug)]
pub struct OpenFile {
    pub file: File,
    /// The path the descriptor was opened with, as given by the caller.
    pub path: PathBuf,
    /// Tracked entry this descriptor is attached to, tagged with the session
    /// that attached it so stale attachments from a finished session are
    /// re-evaluated.
    pub tracked: Option<(Uuid, Arc<TrackedFile>)>,
}

/// Descriptor table. Lives on the engine, not the session: descriptors opened
/// with no session armed still need close and write to work, and descriptors
/// opened before a session starts must be captured once one arms.
#[derive(Debug, Default)]
pub struct HandleTable {
    by_fd: DashMap<RawFd, Arc<Mutex<OpenFile>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            by_fd: DashMap::new(),
        }
    }

    pub fn insert(&self, fd: RawFd, open: OpenFile) {
        self.by_fd.insert(fd, Arc::new(Mutex::new(open)));
    }

    /// Clone the handle out so the shard lock is never held across I/O.
    pub fn get(&self, fd: RawFd) -> Option<Arc<Mutex<OpenFile>>> {
        self.by_fd.get(&fd).map(|e| e.clone())
    }

    pub fn remove(&self, fd: RawFd) -> Option<Arc<Mutex<OpenFile>>> {
        self.by_fd.remove(&fd).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.by_fd.len()
    }
}

/// Compare two root-relative paths in walker traversal order: preorder
/// depth-first with siblings sorted by file name. Component-wise comparison
/// ranks `a/b` before `a.` exactly as the traversal visits them, which plain
/// byte comparison of the joined strings does not.
pub fn walk_order(a: &Path, b: &Path) -> Ordering {
    a.components().cmp(b.components())
}

#[derive(Debug, Default)]
struct CursorState {
    last: Option<PathBuf>,
    complete: bool,
}

/// The walker's position in traversal order. Advanced strictly forward;
/// consulted by the interception surface to decide whether a path will still
/// be visited by the full-file copy.
#[derive(Debug, Default)]
pub struct WalkCursor {
    state: Mutex<CursorState>,
}

impl WalkCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, rel: &Path) {
        let mut st = self.state.lock();
        st.last = Some(rel.to_path_buf());
    }

    pub fn complete(&self) {
        self.state.lock().complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// True when the walker already passed `rel` (or the walk is over) and
    /// will therefore never copy it; mutations must be captured by replay.
    pub fn already_passed(&self, rel: &Path) -> bool {
        let st = self.state.lock();
        if st.complete {
            return true;
        }
        match &st.last {
            Some(last) => walk_order(rel, last) != Ordering::Greater,
            None => false,
        }
    }
}
