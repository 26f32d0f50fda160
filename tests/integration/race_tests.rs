//! Deterministic races between the walker and intercepted writes, using a
//! permit-gated throttle to park the copy at a known offset.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hotbak::copier::Throttle;
use hotbak::engine::{Engine, OpenRequest};
use hotbak::verify::diff_trees;
use parking_lot::{Condvar, Mutex};
use tempfile::tempdir;

const CHUNK: usize = 1024;

struct Gate {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            permits: Mutex::new(0),
            cond: Condvar::new(),
        })
    }

    fn grant(&self, n: usize) {
        let mut permits = self.permits.lock();
        *permits = permits.saturating_add(n);
        self.cond.notify_all();
    }
}

impl Throttle for Gate {
    fn pause(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn writes_behind_the_copy_replay_and_ahead_are_picked_up() -> hotbak::Result<()> {
    let src = tempdir()?;
    let dst = tempdir()?;

    // Four distinct chunks so a lost or duplicated range is visible.
    let mut content = Vec::with_capacity(CHUNK * 4);
    for c in [b'A', b'B', b'C', b'D'] {
        content.extend(std::iter::repeat(c).take(CHUNK));
    }
    fs::write(src.path().join("data.bin"), &content)?;

    let gate = Gate::new();
    let engine = Engine::new(src.path(), dst.path())?
        .with_chunk_size(CHUNK)
        .with_throttle(gate.clone());
    engine.set_keep_capturing(true);

    let fd = engine.open(src.path().join("data.bin"), &OpenRequest::write_only())?;
    let handle = engine.start_backup()?;

    // Let exactly two chunks through: copied-up-to is now 2 * CHUNK.
    gate.grant(2);
    wait_until("two chunks copied", || handle.metrics().chunks_copied == 2);

    // Behind the copy: must replay.
    engine.pwrite(fd, b"behind", 10)?;
    // Straddling the boundary: replays in full.
    let straddle = vec![b'S'; CHUNK];
    engine.pwrite(fd, &straddle, (CHUNK + CHUNK / 2) as u64)?;
    // Ahead of the copy: no replay needed, the walker reads it later.
    engine.pwrite(fd, b"ahead", (3 * CHUNK + 100) as u64)?;

    let before = handle.metrics();
    assert!(
        before.replayed_writes >= 2,
        "behind and straddling writes should have replayed, saw {}",
        before.replayed_writes
    );

    gate.grant(usize::MAX / 2);
    wait_until("tree copy", || handle.tree_copied());

    engine.close(fd)?;
    engine.set_keep_capturing(false);
    let report = engine.finish_backup(handle)?;

    assert!(report.replayed_bytes >= (6 + CHUNK) as u64);
    assert_eq!(report.bytes_copied, (4 * CHUNK) as u64);

    let diffs = diff_trees(src.path(), dst.path())?;
    assert!(diffs.is_empty(), "trees differ: {diffs:?}");
    Ok(())
}

#[test]
fn unlink_during_copy_is_fully_handled() -> hotbak::Result<()> {
    let src = tempdir()?;
    let dst = tempdir()?;
    fs::write(src.path().join("a-doomed"), vec![b'X'; CHUNK * 3])?;
    fs::write(src.path().join("b-stays"), b"survivor")?;

    let gate = Gate::new();
    let engine = Engine::new(src.path(), dst.path())?
        .with_chunk_size(CHUNK)
        .with_throttle(gate.clone());
    engine.set_keep_capturing(true);
    let handle = engine.start_backup()?;

    // One chunk of the doomed file is already in the destination when the
    // unlink arrives; the partial copy must disappear with it.
    gate.grant(1);
    wait_until("first chunk", || handle.metrics().chunks_copied == 1);
    engine.unlink(src.path().join("a-doomed"))?;

    gate.grant(usize::MAX / 2);
    engine.set_keep_capturing(false);
    engine.finish_backup(handle)?;

    assert!(!dst.path().join("a-doomed").exists());
    assert_eq!(fs::read(dst.path().join("b-stays"))?, b"survivor");
    let diffs = diff_trees(src.path(), dst.path())?;
    assert!(diffs.is_empty(), "trees differ: {diffs:?}");
    Ok(())
}

#[test]
fn truncate_below_the_copy_offset_shrinks_the_backup() -> hotbak::Result<()> {
    let src = tempdir()?;
    let dst = tempdir()?;
    fs::write(src.path().join("data.bin"), vec![b'Z'; CHUNK * 4])?;

    let gate = Gate::new();
    let engine = Engine::new(src.path(), dst.path())?
        .with_chunk_size(CHUNK)
        .with_throttle(gate.clone());
    engine.set_keep_capturing(true);

    let fd = engine.open(src.path().join("data.bin"), &OpenRequest::write_only())?;
    let handle = engine.start_backup()?;

    gate.grant(3);
    wait_until("three chunks copied", || handle.metrics().chunks_copied == 3);

    // Shrink below copied-up-to; the destination must follow.
    engine.ftruncate(fd, CHUNK as u64)?;

    gate.grant(usize::MAX / 2);
    wait_until("tree copy", || handle.tree_copied());

    engine.close(fd)?;
    engine.set_keep_capturing(false);
    engine.finish_backup(handle)?;

    assert_eq!(fs::metadata(src.path().join("data.bin"))?.len(), CHUNK as u64);
    assert_eq!(fs::metadata(dst.path().join("data.bin"))?.len(), CHUNK as u64);
    let diffs = diff_trees(src.path(), dst.path())?;
    assert!(diffs.is_empty(), "trees differ: {diffs:?}");
    Ok(())
}
