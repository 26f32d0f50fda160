//! Destination replay: for every intercepted mutation that raced the walker,
//! decide whether the destination needs the same operation and perform it.
//!
//! Replays run with the source operation already completed; a failing replay
//! can only escalate the session, never the source result. All decisions are
//! taken under the entry lock so they are atomic with the walker's
//! copied-up-to advance.

use std::fs;
use std::io;
use std::os::unix::fs::{symlink, FileExt};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use walkdir::WalkDir;

use crate::track::TrackedFile;
use crate::Error;

use std::sync::atomic::Ordering;

use super::Session;

impl Session {
    /// Materialize the destination file for an entry the walker will never
    /// visit (create intercepted after the walk passed the path).
    pub(crate) fn replay_create(&self, entry: &Arc<TrackedFile>) {
        if self.is_dead() {
            return;
        }
        let mut st = entry.lock();
        if st.retired {
            return;
        }
        if let Err(err) = st.dest_handle(&self.source_root, &self.dest_root) {
            let path = st.rel.clone();
            drop(st);
            self.escalate(Error::Replay { path, source: err }.into());
        }
    }

    /// Replay a write when it landed at or behind the walker's copy offset;
    /// a write ahead of the offset is skipped, the walker copies that region
    /// when it reaches it. A straddling write replays in full.
    pub(crate) fn replay_write(&self, entry: &Arc<TrackedFile>, off: u64, data: &[u8]) {
        if self.is_dead() {
            return;
        }
        let mut st = entry.lock();
        if st.retired || !st.needs_replay(off) {
            return;
        }
        let result = st
            .dest_handle(&self.source_root, &self.dest_root)
            .and_then(|f| f.write_all_at(data, off));
        match result {
            Ok(()) => {
                self.metrics.replayed_writes.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .replayed_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                let path = st.rel.clone();
                drop(st);
                self.escalate(Error::Replay { path, source: err }.into());
            }
        }
    }

    /// Truncation is structural: always mirrored, independent of copy
    /// progress.
    pub(crate) fn replay_truncate(&self, entry: &Arc<TrackedFile>, len: u64) {
        if self.is_dead() {
            return;
        }
        let mut st = entry.lock();
        if st.retired {
            return;
        }
        let result = st
            .dest_handle(&self.source_root, &self.dest_root)
            .and_then(|f| f.set_len(len));
        match result {
            Ok(()) => {
                if !st.copy_done && st.copied_up_to > len {
                    st.copied_up_to = len;
                }
                self.metrics
                    .structural_replays
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                let path = st.rel.clone();
                drop(st);
                self.escalate(Error::Replay { path, source: err }.into());
            }
        }
    }

    /// Flush the destination handle when one exists; a file the walker has
    /// not touched yet has nothing to flush.
    pub(crate) fn replay_sync(&self, entry: &Arc<TrackedFile>) {
        if self.is_dead() {
            return;
        }
        let st = entry.lock();
        if st.retired {
            return;
        }
        if let Some(dest) = st.dest.as_ref() {
            if let Err(err) = dest.sync_all() {
                let path = st.rel.clone();
                drop(st);
                self.escalate(Error::Replay { path, source: err }.into());
            }
        }
    }

    /// Drop a descriptor's reference; the last reference of a fully copied
    /// file closes the destination handle and retires the entry.
    pub(crate) fn release(&self, entry: &Arc<TrackedFile>) {
        let mut st = entry.lock();
        st.refs = st.refs.saturating_sub(1);
        if st.refs == 0 && st.copy_done && !st.retired {
            st.dest = None;
            st.retired = true;
            let rel = st.rel.clone();
            drop(st);
            self.map.retire(&rel, entry);
        }
    }

    pub(crate) fn mirror_unlink(&self, rel: &Path) {
        if self.is_dead() {
            return;
        }
        // Retire first so a racing walker copy or replay cannot resurrect
        // the destination file after it is removed.
        self.map.retire_under(rel);
        match fs::remove_file(self.dest_root.join(rel)) {
            Ok(()) => {
                self.metrics
                    .structural_replays
                    .fetch_add(1, Ordering::Relaxed);
            }
            // Never produced by the walker: the file is fully handled.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                self.escalate(
                    Error::Replay {
                        path: rel.to_path_buf(),
                        source: err,
                    }
                    .into(),
                );
            }
        }
    }

    pub(crate) fn mirror_mkdir(&self, rel: &Path) {
        if self.is_dead() {
            return;
        }
        let dest = self.dest_root.join(rel);
        if let Err(err) = fs::create_dir_all(&dest) {
            self.escalate(
                Error::Replay {
                    path: rel.to_path_buf(),
                    source: err,
                }
                .into(),
            );
            return;
        }
        copy_permissions(&self.source_root.join(rel), &dest);
        self.metrics
            .structural_replays
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mirror_rmdir(&self, rel: &Path) {
        if self.is_dead() {
            return;
        }
        self.map.retire_under(rel);
        match fs::remove_dir(self.dest_root.join(rel)) {
            Ok(()) => {
                self.metrics
                    .structural_replays
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                self.escalate(
                    Error::Replay {
                        path: rel.to_path_buf(),
                        source: err,
                    }
                    .into(),
                );
            }
        }
    }

    /// Mirror a rename. Four cases by which side of the source root each end
    /// lies on; `to_abs` is the post-rename source location, used when the
    /// destination has nothing to rename yet and the content must be copied
    /// outright.
    pub(crate) fn mirror_rename(&self, rel_from: Option<&Path>, rel_to: Option<&Path>, to_abs: &Path) {
        if self.is_dead() {
            return;
        }
        let result = match (rel_from, rel_to) {
            (Some(from), Some(to)) => self.rename_within(from, to, to_abs),
            (Some(from), None) => {
                // Moved out of scope: same as removal.
                self.map.retire_under(from);
                remove_any(&self.dest_root.join(from))
            }
            (None, Some(to)) => {
                // Moved into scope: content appears; copy it wholesale. The
                // copy makes capture the owner of everything underneath.
                let copied = copy_any(to_abs, &self.dest_root.join(to));
                if copied.is_ok() {
                    self.map.mark_copy_done_under(to);
                }
                copied
            }
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => {
                self.metrics
                    .structural_replays
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                let path = rel_to.or(rel_from).unwrap_or(to_abs).to_path_buf();
                self.escalate(Error::Replay { path, source: err }.into());
            }
        }
    }

    fn rename_within(&self, from: &Path, to: &Path, to_abs: &Path) -> io::Result<()> {
        let dest_from = self.dest_root.join(from);
        let dest_to = self.dest_root.join(to);
        if let Some(parent) = dest_to.parent() {
            fs::create_dir_all(parent)?;
        }
        let renamed = if dest_from.exists() {
            fs::rename(&dest_from, &dest_to)?;
            true
        } else {
            // The walker never produced the old path; take the content from
            // the post-rename source location instead.
            copy_any(to_abs, &dest_to)?;
            false
        };
        self.map.relocate_prefix(from, to);
        if !renamed {
            // Fully copied here; capture owns the new location from now on.
            self.map.mark_copy_done_under(to);
        }
        debug!(
            session = %self.id,
            from = %from.display(),
            to = %to.display(),
            renamed,
            "rename mirrored"
        );
        Ok(())
    }
}

fn copy_permissions(src: &Path, dest: &Path) {
    if let Ok(meta) = fs::metadata(src) {
        let _ = fs::set_permissions(dest, meta.permissions());
    }
}

/// Remove a destination path of whatever kind; already-gone is success.
fn remove_any(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy a source file, symlink, or directory tree to a destination path.
fn copy_any(src: &Path, dest: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if meta.file_type().is_symlink() {
        remove_any(dest)?;
        return symlink(fs::read_link(src)?, dest);
    }
    if meta.is_file() {
        fs::copy(src, dest).map(|_| ())
    } else {
        for entry in WalkDir::new(src).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk aborted"))
            })?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let target = dest.join(rel);
            let ft = entry.file_type();
            if ft.is_dir() {
                fs::create_dir_all(&target)?;
            } else if ft.is_symlink() {
                remove_any(&target)?;
                symlink(fs::read_link(entry.path())?, &target)?;
            } else {
                fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }
}
