//! Tree copy and move helpers for staging and settings carry-over.

use std::fs;
use std::io;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::markers::MARKER_DIR;
use crate::util::{MonotonicProgress, progress_fraction};

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "copy cancelled")
}

fn walk(src: &Path) -> impl Iterator<Item = io::Result<walkdir::DirEntry>> {
    WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != MARKER_DIR)
        .map(|entry| entry.map_err(io::Error::from))
}

/// Copy everything under `src` into `dst`, overwriting. Returns the file count.
pub fn copy_tree(
    src: &Path,
    dst: &Path,
    progress: &mut (dyn FnMut(f32) + Send),
    cancel: &CancellationToken,
) -> io::Result<usize> {
    let total = walk(src)
        .filter(|entry| entry.as_ref().is_ok_and(|e| e.file_type().is_file()))
        .count() as u64;
    let mut gate = MonotonicProgress::new(progress);
    gate.report(0.0);

    fs::create_dir_all(dst)?;
    let mut copied = 0usize;
    for entry in walk(src) {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)?;
        copied += 1;
        if let Some(fraction) = progress_fraction(copied as u64, Some(total)) {
            gate.report(fraction);
        }
    }
    gate.report(1.0);
    Ok(copied)
}

/// Move the contents of `staging` over `dest` by rename. Both must share a file system.
pub fn move_tree(staging: &Path, dest: &Path) -> io::Result<usize> {
    let mut moved = 0usize;
    for entry in walk(staging) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(staging).map_err(io::Error::other)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.is_dir() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(entry.path(), &target)?;
        moved += 1;
    }
    Ok(moved)
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
