//! Directory walker: the background thread that streams the source tree into
//! the destination in deterministic order.
//!
//! Each regular file is copied in bounded chunks under its entry lock, so the
//! per-file copy interleaves with intercepted replays without losing or
//! duplicating a racing write. Application threads are never blocked for
//! longer than one chunk.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{symlink, FileExt};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::engine::{Control, Session, SessionState};
use crate::{Error, Result};

/// Pacing hook invoked between chunk copies. The default does nothing; a
/// rate limiter (or a test gate) can slow the walker down without touching
/// the copy logic.
pub trait Throttle: Send + Sync {
    fn pause(&self);
}

#[derive(Debug, Default)]
pub struct NoThrottle;

impl Throttle for NoThrottle {
    fn pause(&self) {}
}

/// Walker thread body. Failures are parked in the session's error slot; the
/// thread itself only reports a panic-free exit.
pub(crate) fn run(control: Arc<Control>, session: Arc<Session>) -> Result<()> {
    walk_tree(&session);
    session.cursor.complete();

    let keep = control.keep_capturing.load(Ordering::SeqCst);
    if !keep {
        // Nothing more to capture: disarm interception right away instead of
        // waiting for finish.
        let mut slot = control.slot.write();
        if slot.as_ref().map_or(false, |s| s.id == session.id) {
            *slot = None;
        }
    }
    {
        let mut state = session.state.lock();
        if *state == SessionState::Copying {
            *state = SessionState::CapturingOnly;
        }
    }
    info!(
        session = %session.id,
        keep_capturing = keep,
        "tree copy complete"
    );
    Ok(())
}

fn walk_tree(session: &Arc<Session>) {
    for entry in WalkDir::new(&session.source_root).sort_by_file_name() {
        if session.is_dead() {
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // A path that vanished mid-traversal is fully handled.
                if err
                    .io_error()
                    .map_or(false, |e| e.kind() == io::ErrorKind::NotFound)
                {
                    continue;
                }
                let path = err
                    .path()
                    .unwrap_or(&session.source_root)
                    .to_path_buf();
                let source = err
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk aborted"));
                session.escalate(Error::Copy { path, source }.into());
                return;
            }
        };

        let Some(rel) = session.rel_of(entry.path()) else {
            continue;
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            copy_dir(session, &rel);
        } else if file_type.is_symlink() {
            copy_symlink(session, &rel);
        } else if file_type.is_file() {
            copy_file(session, &rel);
        }
        // Advance only once the entry is fully handled: a path equal to the
        // cursor therefore counts as passed, and a descriptor attached while
        // its file is still being copied keeps the offset-based replay
        // decision.
        session.cursor.advance(&rel);
        if session.is_dead() {
            return;
        }
    }
}

fn copy_dir(session: &Arc<Session>, rel: &Path) {
    let dest = session.dest_root.join(rel);
    if let Err(err) = fs::create_dir_all(&dest) {
        session.escalate(
            Error::Copy {
                path: rel.to_path_buf(),
                source: err,
            }
            .into(),
        );
        return;
    }
    if let Ok(meta) = fs::metadata(session.source_root.join(rel)) {
        let _ = fs::set_permissions(&dest, meta.permissions());
    }
}

fn copy_symlink(session: &Arc<Session>, rel: &Path) {
    let src = session.source_root.join(rel);
    let dest = session.dest_root.join(rel);
    let result = (|| -> io::Result<()> {
        let target = fs::read_link(&src)?;
        match fs::remove_file(&dest) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        symlink(target, &dest)
    })();
    match result {
        Ok(()) => {}
        // Vanished before we read it: fully handled.
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => session.escalate(
            Error::Copy {
                path: rel.to_path_buf(),
                source: err,
            }
            .into(),
        ),
    }
}

/// Stream one regular file. The chunk read, the destination write, and the
/// copied-up-to advance happen under the entry lock; the lock is dropped
/// between chunks so intercepted calls get in.
fn copy_file(session: &Arc<Session>, rel: &Path) {
    let entry = session.map.get_or_insert(rel);
    let src = match File::open(session.source_root.join(rel)) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            // Unlinked between listing and open: fully handled.
            let mut st = entry.lock();
            if st.refs == 0 && !st.retired {
                st.retired = true;
                let rel = st.rel.clone();
                drop(st);
                session.map.retire(&rel, &entry);
            }
            return;
        }
        Err(err) => {
            session.escalate(
                Error::Copy {
                    path: rel.to_path_buf(),
                    source: err,
                }
                .into(),
            );
            return;
        }
    };

    let mut buf = vec![0u8; session.chunk_size];
    loop {
        session.throttle.pause();
        if session.is_dead() {
            return;
        }

        let mut st = entry.lock();
        if st.retired {
            return;
        }
        let off = st.copied_up_to;
        let n = match src.read_at(&mut buf, off) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                drop(st);
                session.escalate(
                    Error::Copy {
                        path: rel.to_path_buf(),
                        source: err,
                    }
                    .into(),
                );
                return;
            }
        };

        if n == 0 {
            st.copy_done = true;
            session.metrics.files_copied.fetch_add(1, Ordering::Relaxed);
            if st.refs == 0 {
                st.dest = None;
                st.retired = true;
                let rel = st.rel.clone();
                drop(st);
                session.map.retire(&rel, &entry);
            }
            debug!(session = %session.id, path = %rel.display(), "file copied");
            return;
        }

        let write = st
            .dest_handle(&session.source_root, &session.dest_root)
            .and_then(|f| f.write_all_at(&buf[..n], off));
        match write {
            Ok(()) => {
                st.copied_up_to = off + n as u64;
                session
                    .metrics
                    .bytes_copied
                    .fetch_add(n as u64, Ordering::Relaxed);
                session.metrics.chunks_copied.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                drop(st);
                session.escalate(
                    Error::Copy {
                        path: rel.to_path_buf(),
                        source: err,
                    }
                    .into(),
                );
                return;
            }
        }
    }
}
