//! Unit tests for recursive tree comparison.

use std::fs;
use std::os::unix::fs::symlink;

use hotbak::verify::{diff_trees, Difference, Side};
use tempfile::tempdir;

#[test]
fn identical_trees_report_nothing() -> hotbak::Result<()> {
    let left = tempdir()?;
    let right = tempdir()?;
    for root in [left.path(), right.path()] {
        fs::create_dir_all(root.join("a/b"))?;
        fs::write(root.join("a/b/file"), b"same bytes")?;
        fs::write(root.join("top"), b"")?;
        symlink("a/b/file", root.join("link"))?;
    }

    assert!(diff_trees(left.path(), right.path())?.is_empty());
    Ok(())
}

#[test]
fn content_difference_is_reported() -> hotbak::Result<()> {
    let left = tempdir()?;
    let right = tempdir()?;
    fs::write(left.path().join("f"), b"aaaa")?;
    fs::write(right.path().join("f"), b"aaab")?;

    let diffs = diff_trees(left.path(), right.path())?;
    assert_eq!(diffs.len(), 1);
    assert!(matches!(&diffs[0], Difference::Content(p) if p.as_os_str() == "f"));
    Ok(())
}

#[test]
fn same_length_different_bytes_is_caught() -> hotbak::Result<()> {
    let left = tempdir()?;
    let right = tempdir()?;
    // Differ only in the last byte of a multi-chunk file.
    let mut a = vec![7u8; 200_000];
    let b = a.clone();
    *a.last_mut().expect("non-empty") = 8;
    fs::write(left.path().join("big"), &a)?;
    fs::write(right.path().join("big"), &b)?;

    let diffs = diff_trees(left.path(), right.path())?;
    assert_eq!(diffs.len(), 1);
    assert!(matches!(&diffs[0], Difference::Content(_)));
    Ok(())
}

#[test]
fn missing_entries_name_the_side() -> hotbak::Result<()> {
    let left = tempdir()?;
    let right = tempdir()?;
    fs::write(left.path().join("only-left"), b"l")?;
    fs::write(right.path().join("only-right"), b"r")?;

    let diffs = diff_trees(left.path(), right.path())?;
    assert_eq!(diffs.len(), 2);
    assert!(diffs
        .iter()
        .any(|d| matches!(d, Difference::OnlyIn(Side::Left, p) if p.as_os_str() == "only-left")));
    assert!(diffs
        .iter()
        .any(|d| matches!(d, Difference::OnlyIn(Side::Right, p) if p.as_os_str() == "only-right")));
    Ok(())
}

#[test]
fn kind_mismatch_is_reported() -> hotbak::Result<()> {
    let left = tempdir()?;
    let right = tempdir()?;
    fs::write(left.path().join("x"), b"file")?;
    fs::create_dir(right.path().join("x"))?;

    let diffs = diff_trees(left.path(), right.path())?;
    assert_eq!(diffs.len(), 1);
    assert!(matches!(&diffs[0], Difference::Kind(p) if p.as_os_str() == "x"));
    Ok(())
}

#[test]
fn symlink_targets_are_compared() -> hotbak::Result<()> {
    let left = tempdir()?;
    let right = tempdir()?;
    symlink("target-a", left.path().join("l"))?;
    symlink("target-b", right.path().join("l"))?;

    let diffs = diff_trees(left.path(), right.path())?;
    assert_eq!(diffs.len(), 1);
    assert!(matches!(&diffs[0], Difference::LinkTarget(_)));
    Ok(())
}
