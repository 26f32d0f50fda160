//! Backup session controller: the state machine and control API bounding one
//! hot-backup window, plus the interception surface the application threads
//! call through ([`intercept`]) and the destination replay logic ([`capture`]).

pub mod capture;
pub mod intercept;

pub use intercept::{Fd, OpenRequest};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::copier::{self, NoThrottle, Throttle};
use crate::logging::CopierSnapshot;
use crate::track::{FileMap, HandleTable, WalkCursor};
use crate::{Error, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Walker still streaming the initial tree copy.
    Copying,
    /// Tree copy complete; interception may still be armed.
    CapturingOnly,
    Finished,
    Error,
}

/// Progress counters shared between the walker and the replay paths.
#[derive(Debug, Default)]
pub struct Metrics {
    pub files_copied: AtomicU64,
    pub bytes_copied: AtomicU64,
    pub chunks_copied: AtomicU64,
    pub replayed_writes: AtomicU64,
    pub replayed_bytes: AtomicU64,
    pub structural_replays: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> CopierSnapshot {
        CopierSnapshot {
            files_copied: self.files_copied.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            chunks_copied: self.chunks_copied.load(Ordering::Relaxed),
            replayed_writes: self.replayed_writes.load(Ordering::Relaxed),
            replayed_bytes: self.replayed_bytes.load(Ordering::Relaxed),
            structural_replays: self.structural_replays.load(Ordering::Relaxed),
        }
    }
}

/// Summary returned when a session finishes cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub chunks_copied: u64,
    pub replayed_writes: u64,
    pub replayed_bytes: u64,
    pub structural_replays: u64,
    pub started_at: u64,
    pub finished_at: u64,
}

/// One bounded backup window. Owned by the engine's session slot while armed
/// and by the [`BackupHandle`] until finish.
pub(crate) struct Session {
    pub(crate) id: Uuid,
    pub(crate) source_root: PathBuf,
    pub(crate) dest_root: PathBuf,
    pub(crate) chunk_size: usize,
    pub(crate) throttle: Arc<dyn Throttle>,
    pub(crate) map: FileMap,
    pub(crate) cursor: WalkCursor,
    pub(crate) metrics: Metrics,
    pub(crate) state: Mutex<SessionState>,
    fatal: Mutex<Option<anyhow::Error>>,
    dead: AtomicBool,
    started_at: u64,
}

impl Session {
    fn new(engine: &Engine) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_root: engine.source_root.clone(),
            dest_root: engine.dest_root.clone(),
            chunk_size: engine.chunk_size,
            throttle: engine.throttle.clone(),
            map: FileMap::new(),
            cursor: WalkCursor::new(),
            metrics: Metrics::default(),
            state: Mutex::new(SessionState::Copying),
            fatal: Mutex::new(None),
            dead: AtomicBool::new(false),
            started_at: now_secs(),
        }
    }

    /// Path relative to the source root, when the path lies inside it. The
    /// root itself is not an in-scope target of any operation.
    pub(crate) fn rel_of(&self, path: &Path) -> Option<PathBuf> {
        let rel = path.strip_prefix(&self.source_root).ok()?;
        if rel.as_os_str().is_empty() {
            return None;
        }
        Some(rel.to_path_buf())
    }

    /// Record a session-fatal mirror failure. The source-side operation has
    /// already completed and is not affected; the session stops mirroring and
    /// surfaces the error from finish.
    pub(crate) fn escalate(&self, err: anyhow::Error) {
        warn!(session = %self.id, error = %err, "backup session failed");
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.dead.store(true, Ordering::SeqCst);
        *self.state.lock() = SessionState::Error;
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn take_fatal(&self) -> Option<anyhow::Error> {
        self.fatal.lock().take()
    }

    fn report(&self) -> SessionReport {
        let snap = self.metrics.snapshot();
        SessionReport {
            session_id: self.id,
            source: self.source_root.clone(),
            dest: self.dest_root.clone(),
            files_copied: snap.files_copied,
            bytes_copied: snap.bytes_copied,
            chunks_copied: snap.chunks_copied,
            replayed_writes: snap.replayed_writes,
            replayed_bytes: snap.replayed_bytes,
            structural_replays: snap.structural_replays,
            started_at: self.started_at,
            finished_at: now_secs(),
        }
    }
}

/// Armed-session slot and the capture flag, shared with the walker thread so
/// it can disarm interception when the tree copy completes.
pub(crate) struct Control {
    pub(crate) keep_capturing: AtomicBool,
    pub(crate) slot: RwLock<Option<Arc<Session>>>,
}

/// Join handle for a running backup session.
pub struct BackupHandle {
    session: Arc<Session>,
    join: JoinHandle<Result<()>>,
}

impl std::fmt::Debug for BackupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupHandle")
            .field("session_id", &self.session.id)
            .finish()
    }
}

impl BackupHandle {
    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    /// Live progress counters; usable while the walker is still running.
    pub fn metrics(&self) -> CopierSnapshot {
        self.session.metrics.snapshot()
    }

    /// True once the walker finished the whole tree, whether or not capture
    /// is still armed.
    pub fn tree_copied(&self) -> bool {
        self.session.cursor.is_complete()
    }
}

/// Hot-backup engine for one source/destination pair.
///
/// Application code performs its file mutations through the engine's
/// interception surface ([`Engine::open`], [`Engine::write`], ...). With no
/// session armed every call forwards to the real file system unchanged; while
/// a session is armed, in-scope mutations are mirrored into the destination
/// tree so the finished copy is consistent per file.
pub struct Engine {
    source_root: PathBuf,
    dest_root: PathBuf,
    chunk_size: usize,
    throttle: Arc<dyn Throttle>,
    pub(crate) handles: HandleTable,
    pub(crate) control: Arc<Control>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("source_root", &self.source_root)
            .field("dest_root", &self.dest_root)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(source_root: impl Into<PathBuf>, dest_root: impl Into<PathBuf>) -> Result<Self> {
        let source_root = source_root.into();
        let dest_root = dest_root.into();
        if !source_root.is_dir() {
            return Err(Error::InvalidSourceDir(source_root.display().to_string()).into());
        }
        if dest_root.exists() && !dest_root.is_dir() {
            return Err(Error::InvalidDestDir(dest_root.display().to_string()).into());
        }
        Ok(Self {
            source_root,
            dest_root,
            chunk_size: DEFAULT_CHUNK_SIZE,
            throttle: Arc::new(NoThrottle),
            handles: HandleTable::new(),
            control: Arc::new(Control {
                keep_capturing: AtomicBool::new(false),
                slot: RwLock::new(None),
            }),
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Install a pacing hook invoked between walker chunks.
    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    /// Arm or disarm post-copy capture. May be toggled at any time, including
    /// before a session starts or after the tree walk completed.
    pub fn set_keep_capturing(&self, keep: bool) {
        self.control.keep_capturing.store(keep, Ordering::SeqCst);
    }

    pub fn keep_capturing(&self) -> bool {
        self.control.keep_capturing.load(Ordering::SeqCst)
    }

    pub fn backup_active(&self) -> bool {
        self.control.slot.read().is_some()
    }

    /// Begin a session: arm interception and spawn the walker thread.
    /// Starting while a session is armed is a usage error.
    pub fn start_backup(&self) -> Result<BackupHandle> {
        fs::create_dir_all(&self.dest_root)?;

        let session = {
            let mut slot = self.control.slot.write();
            if slot.is_some() {
                return Err(Error::SessionActive.into());
            }
            let session = Arc::new(Session::new(self));
            *slot = Some(session.clone());
            session
        };

        info!(
            session = %session.id,
            source = %self.source_root.display(),
            dest = %self.dest_root.display(),
            "backup session started"
        );

        let control = self.control.clone();
        let walker_session = session.clone();
        let join = std::thread::Builder::new()
            .name("hotbak-walker".into())
            .spawn(move || copier::run(control, walker_session))?;

        Ok(BackupHandle { session, join })
    }

    /// Block until the walker finished the full tree copy, disarm
    /// interception, and surface any session-fatal error.
    pub fn finish_backup(&self, handle: BackupHandle) -> Result<SessionReport> {
        let BackupHandle { session, join } = handle;

        // A handle for some other engine's session is a usage error; the
        // armed session here would keep running behind the caller's back.
        if let Some(active) = self.control.slot.read().as_ref() {
            if active.id != session.id {
                return Err(Error::NoActiveSession.into());
            }
        }

        let walk_result = join.join().map_err(|_| Error::WalkerPanicked)?;

        {
            let mut slot = self.control.slot.write();
            if slot.as_ref().map_or(false, |s| s.id == session.id) {
                *slot = None;
            }
        }

        if let Some(err) = session.take_fatal() {
            *session.state.lock() = SessionState::Error;
            return Err(err);
        }
        walk_result?;

        *session.state.lock() = SessionState::Finished;
        let report = session.report();
        info!(
            session = %session.id,
            files_copied = report.files_copied,
            bytes_copied = report.bytes_copied,
            replayed_writes = report.replayed_writes,
            "backup session finished"
        );
        Ok(report)
    }

    /// The armed session, if interception is currently live.
    pub(crate) fn armed(&self) -> Option<Arc<Session>> {
        let session = self.control.slot.read().clone()?;
        if session.is_dead() {
            return None;
        }
        Some(session)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
