//! Interception surface: the file-mutating calls application threads route
//! through the engine.
//!
//! With no session armed every call forwards to the real file system and
//! returns its result bit-for-bit. While a session is armed, a call whose
//! path lies inside the source root additionally mirrors into the destination
//! tree; mirror failures never alter the source result, they escalate the
//! session instead. The engine's own destination I/O goes through `std::fs`
//! directly and can never re-enter this surface.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Seek, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::track::{OpenFile, TrackedFile};

use super::{Engine, Session};

/// Opaque descriptor handed out by [`Engine::open`]; wraps the raw source
/// descriptor number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(RawFd);

impl Fd {
    pub fn raw(&self) -> RawFd {
        self.0
    }
}

/// Open flags, the subset of the POSIX open surface the engine intercepts.
#[derive(Debug, Clone, Default)]
pub struct OpenRequest {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
    pub mode: Option<u32>,
}

impl OpenRequest {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn create_write(mode: u32) -> Self {
        Self {
            write: true,
            create: true,
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn truncated(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub fn appended(mut self) -> Self {
        self.append = true;
        self
    }

    fn to_open_options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.read || (!self.write && !self.append))
            .write(self.write)
            .append(self.append)
            .create(self.create)
            .create_new(self.create_new)
            .truncate(self.truncate);
        if let Some(mode) = self.mode {
            opts.mode(mode);
        }
        opts
    }
}

fn bad_fd() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

impl Engine {
    /// Open (or create) a file. The source open's outcome is returned
    /// unchanged; in scope it also registers the descriptor for capture.
    pub fn open(&self, path: impl AsRef<Path>, req: &OpenRequest) -> io::Result<Fd> {
        let path = path.as_ref();
        // Whether this open brings a new file into existence decides capture
        // ownership below; checked only while a session is armed.
        let pre_existed = self.armed().is_some() && path.exists();
        let file = req.to_open_options().open(path)?;
        let fd = Fd(file.as_raw_fd());
        let mut open = OpenFile {
            file,
            path: path.to_path_buf(),
            tracked: None,
        };

        if let Some(session) = self.armed() {
            if let Some(entry) = self.attach(&session, &mut open) {
                let truncating = req.truncate && (req.write || req.append);
                let created = req.create_new || (req.create && !pre_existed);
                let copy_done = {
                    let mut st = entry.lock();
                    // A file this open created (or emptied) has no prior
                    // bytes for the walker to contribute; its directory
                    // listing may already be consumed, so capture owns the
                    // file outright.
                    if created || truncating {
                        st.copy_done = true;
                    }
                    st.copy_done
                };
                if copy_done {
                    // Materialize the destination now so a create with no
                    // writes still shows up in the copy.
                    session.replay_create(&entry);
                }
                if truncating {
                    session.replay_truncate(&entry, 0);
                }
            }
        }

        self.handles.insert(fd.0, open);
        Ok(fd)
    }

    /// `creat`: create-or-truncate for writing.
    pub fn create(&self, path: impl AsRef<Path>, mode: u32) -> io::Result<Fd> {
        self.open(path, &OpenRequest::create_write(mode).truncated())
    }

    /// Cursor write. The affected offset is wherever the descriptor's cursor
    /// landed the bytes (append included).
    pub fn write(&self, fd: Fd, buf: &[u8]) -> io::Result<usize> {
        let handle = self.handles.get(fd.0).ok_or_else(bad_fd)?;
        let mut open = handle.lock();
        let n = open.file.write(buf)?;
        let end = open.file.stream_position()?;
        let off = end.saturating_sub(n as u64);
        self.mirror_write(&mut open, off, &buf[..n]);
        Ok(n)
    }

    /// Positional write; the descriptor's cursor is unaffected.
    pub fn pwrite(&self, fd: Fd, buf: &[u8], off: u64) -> io::Result<usize> {
        let handle = self.handles.get(fd.0).ok_or_else(bad_fd)?;
        let mut open = handle.lock();
        let n = open.file.write_at(buf, off)?;
        self.mirror_write(&mut open, off, &buf[..n]);
        Ok(n)
    }

    /// Close a descriptor. The last close of a fully copied file releases its
    /// destination handle and retires the entry.
    pub fn close(&self, fd: Fd) -> io::Result<()> {
        let handle = self.handles.remove(fd.0).ok_or_else(bad_fd)?;
        let mut open = handle.lock();
        if let Some((session_id, entry)) = open.tracked.take() {
            match self.armed() {
                Some(session) if session.id == session_id => session.release(&entry),
                _ => {
                    // Session already over; just drop the reference.
                    let mut st = entry.lock();
                    st.refs = st.refs.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    pub fn unlink(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        fs::remove_file(path)?;
        if let Some(session) = self.armed() {
            if let Some(rel) = session.rel_of(path) {
                session.mirror_unlink(&rel);
            }
        }
        Ok(())
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> io::Result<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        fs::rename(from, to)?;
        if let Some(session) = self.armed() {
            let rel_from = session.rel_of(from);
            let rel_to = session.rel_of(to);
            if rel_from.is_some() || rel_to.is_some() {
                session.mirror_rename(rel_from.as_deref(), rel_to.as_deref(), to);
            }
        }
        Ok(())
    }

    pub fn mkdir(&self, path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
        let path = path.as_ref();
        DirBuilder::new().mode(mode).create(path)?;
        if let Some(session) = self.armed() {
            if let Some(rel) = session.rel_of(path) {
                session.mirror_mkdir(&rel);
            }
        }
        Ok(())
    }

    pub fn rmdir(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        fs::remove_dir(path)?;
        if let Some(session) = self.armed() {
            if let Some(rel) = session.rel_of(path) {
                session.mirror_rmdir(&rel);
            }
        }
        Ok(())
    }

    pub fn ftruncate(&self, fd: Fd, len: u64) -> io::Result<()> {
        let handle = self.handles.get(fd.0).ok_or_else(bad_fd)?;
        let mut open = handle.lock();
        open.file.set_len(len)?;
        if let Some(session) = self.armed() {
            if let Some(entry) = self.attach(&session, &mut open) {
                session.replay_truncate(&entry, len);
            }
        }
        Ok(())
    }

    pub fn fsync(&self, fd: Fd) -> io::Result<()> {
        let handle = self.handles.get(fd.0).ok_or_else(bad_fd)?;
        let mut open = handle.lock();
        open.file.sync_all()?;
        if let Some(session) = self.armed() {
            if let Some(entry) = self.attach(&session, &mut open) {
                session.replay_sync(&entry);
            }
        }
        Ok(())
    }

    /// Attach a descriptor to the armed session's tracked entry for its path.
    /// Descriptors opened before the session started (or under an earlier
    /// session) attach lazily on their first intercepted operation.
    fn attach(&self, session: &Arc<Session>, open: &mut OpenFile) -> Option<Arc<TrackedFile>> {
        if let Some((session_id, entry)) = &open.tracked {
            if *session_id == session.id {
                return Some(entry.clone());
            }
        }
        let rel = session.rel_of(&open.path)?;
        let entry = session.map.get_or_insert(&rel);
        {
            let mut st = entry.lock();
            st.refs += 1;
            if session.cursor.already_passed(&rel) {
                // The walker will not come back for this path; from here on
                // every write must replay.
                st.copy_done = true;
            }
        }
        debug!(session = %session.id, path = %rel.display(), "descriptor attached");
        open.tracked = Some((session.id, entry.clone()));
        Some(entry)
    }

    fn mirror_write(&self, open: &mut OpenFile, off: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(session) = self.armed() else { return };
        let Some(entry) = self.attach(&session, open) else {
            return;
        };
        session.replay_write(&entry, off, data);
    }
}
