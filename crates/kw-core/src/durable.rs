//! Crash-safe file replacement.
//!
//! The new content is written to a temp file next to the target and
//! fsynced, renamed over the target, and then the directory is fsynced. A
//! crash at any point leaves either the old or the new file in place.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// First half: fully write and sync `tmp_path`.
pub fn stage(tmp_path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Second half: rename `tmp_path` over `dest` and sync the directory entry.
pub fn promote(tmp_path: &Path, dest: &Path) -> std::io::Result<()> {
    fs::rename(tmp_path, dest)?;
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

/// Replace `dest` with `bytes`, staging through `tmp_path`.
pub fn replace(dest: &Path, tmp_path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    stage(tmp_path, bytes, mode)?;
    promote(tmp_path, dest)
}
