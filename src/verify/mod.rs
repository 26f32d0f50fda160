//! Recursive byte-for-byte comparison of two directory trees.
//!
//! The backup has no manifest; the destination tree itself is the product,
//! and this is the check that it matches the source.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::Result;

const COMPARE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Difference {
    /// Present on one side only.
    OnlyIn(Side, PathBuf),
    /// Different kinds (file vs directory vs symlink).
    Kind(PathBuf),
    /// Regular files with different bytes.
    Content(PathBuf),
    /// Symlinks with different targets.
    LinkTarget(PathBuf),
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difference::OnlyIn(side, p) => write!(f, "only in {side}: {}", p.display()),
            Difference::Kind(p) => write!(f, "kind mismatch: {}", p.display()),
            Difference::Content(p) => write!(f, "content mismatch: {}", p.display()),
            Difference::LinkTarget(p) => write!(f, "link target mismatch: {}", p.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
    Symlink,
}

fn tree_entries(root: &Path) -> Result<BTreeMap<PathBuf, Kind>> {
    let mut entries = BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root)?.to_path_buf();
        if rel.as_os_str().is_empty() {
            continue;
        }
        let ft = entry.file_type();
        let kind = if ft.is_symlink() {
            Kind::Symlink
        } else if ft.is_dir() {
            Kind::Dir
        } else {
            Kind::File
        };
        entries.insert(rel, kind);
    }
    Ok(entries)
}

fn files_equal(a: &Path, b: &Path) -> io::Result<bool> {
    let (meta_a, meta_b) = (fs::metadata(a)?, fs::metadata(b)?);
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    let (mut fa, mut fb) = (File::open(a)?, File::open(b)?);
    let mut buf_a = vec![0u8; COMPARE_CHUNK];
    let mut buf_b = vec![0u8; COMPARE_CHUNK];
    loop {
        let na = read_full(&mut fa, &mut buf_a)?;
        let nb = read_full(&mut fb, &mut buf_b)?;
        if na != nb || buf_a[..na] != buf_b[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Compare two trees recursively; an empty result means byte-identical
/// content, matching names, and matching symlink targets throughout.
pub fn diff_trees(left: &Path, right: &Path) -> Result<Vec<Difference>> {
    let left_entries = tree_entries(left)?;
    let right_entries = tree_entries(right)?;
    let mut differences = Vec::new();

    for (rel, kind) in &left_entries {
        match right_entries.get(rel) {
            None => differences.push(Difference::OnlyIn(Side::Left, rel.clone())),
            Some(other) if other != kind => differences.push(Difference::Kind(rel.clone())),
            Some(_) => match kind {
                Kind::Dir => {}
                Kind::File => {
                    if !files_equal(&left.join(rel), &right.join(rel))? {
                        differences.push(Difference::Content(rel.clone()));
                    }
                }
                Kind::Symlink => {
                    if fs::read_link(left.join(rel))? != fs::read_link(right.join(rel))? {
                        differences.push(Difference::LinkTarget(rel.clone()));
                    }
                }
            },
        }
    }
    for rel in right_entries.keys() {
        if !left_entries.contains_key(rel) {
            differences.push(Difference::OnlyIn(Side::Right, rel.clone()));
        }
    }

    Ok(differences)
}
