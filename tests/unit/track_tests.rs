//! Unit tests for the tracked-file registry and walk cursor.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use hotbak::track::{walk_order, FileMap, WalkCursor};

#[test]
fn concurrent_opens_converge_on_one_entry() {
    let map = Arc::new(FileMap::new());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                let entry = map.get_or_insert(Path::new("dir/shared"));
                entry.lock().refs += 1;
                entry
            })
        })
        .collect();

    let entries: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread should not panic"))
        .collect();

    assert_eq!(map.len(), 1);
    for entry in &entries[1..] {
        assert!(Arc::ptr_eq(&entries[0], entry));
    }
    assert_eq!(entries[0].lock().refs, 8);
}

#[test]
fn interleaved_open_close_keeps_counts_consistent() {
    let map = Arc::new(FileMap::new());

    // Half the threads register a descriptor, half deregister one that a
    // registering thread produced; net count must come out exact.
    let opens: Vec<_> = (0..4)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                let entry = map.get_or_insert(Path::new("f"));
                entry.lock().refs += 1;
            })
        })
        .collect();
    for h in opens {
        h.join().expect("open thread");
    }

    let closes: Vec<_> = (0..3)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                let entry = map.get_or_insert(Path::new("f"));
                let mut st = entry.lock();
                st.refs = st.refs.saturating_sub(1);
            })
        })
        .collect();
    for h in closes {
        h.join().expect("close thread");
    }

    let entry = map.get(Path::new("f")).expect("entry still live");
    assert_eq!(entry.lock().refs, 1);
}

#[test]
fn replay_decision_tracks_copy_progress() {
    let map = FileMap::new();
    let entry = map.get_or_insert(Path::new("data"));

    {
        let mut st = entry.lock();
        st.copied_up_to = 4096;
        assert!(st.needs_replay(0));
        assert!(st.needs_replay(4095));
        assert!(!st.needs_replay(4096));
        assert!(!st.needs_replay(10_000));

        // Once the copy is done every offset replays, including appends past
        // the size the walker saw.
        st.copy_done = true;
        assert!(st.needs_replay(4096));
        assert!(st.needs_replay(1 << 40));
    }
}

#[test]
fn retired_entries_are_dropped_from_lookup() {
    let map = FileMap::new();
    let entry = map.get_or_insert(Path::new("gone"));
    entry.lock().retired = true;
    map.retire(Path::new("gone"), &entry);
    assert!(map.get(Path::new("gone")).is_none());
    assert!(map.is_empty());
}

#[test]
fn retire_under_clears_a_subtree() {
    let map = FileMap::new();
    map.get_or_insert(Path::new("keep/a"));
    let doomed = map.get_or_insert(Path::new("drop/a"));
    map.get_or_insert(Path::new("drop/b/c"));

    map.retire_under(Path::new("drop"));

    assert!(map.get(Path::new("keep/a")).is_some());
    assert!(map.get(Path::new("drop/a")).is_none());
    assert!(map.get(Path::new("drop/b/c")).is_none());
    assert!(doomed.lock().retired);
}

#[test]
fn walk_order_is_traversal_order_not_byte_order() {
    // "a/b" is visited while the walker is inside "a", before sibling "a.".
    assert_eq!(
        walk_order(Path::new("a/b"), Path::new("a.")),
        std::cmp::Ordering::Less
    );
    // Plain string comparison would say the opposite.
    assert!("a/b" > "a.");
}

#[test]
fn cursor_complete_passes_everything() {
    let cursor = WalkCursor::new();
    cursor.advance(Path::new("m"));
    assert!(!cursor.already_passed(Path::new("z")));
    cursor.complete();
    assert!(cursor.already_passed(Path::new("z")));
    assert!(cursor.already_passed(Path::new("a")));
}
