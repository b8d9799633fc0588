//! Filesystem helpers shared by the snapshot, bootstrap and update engines.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Creates `path` and any missing parents with the given mode.
pub(crate) fn create_dir_all_mode(path: &Path, mode: u32) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(mode).create(path)
}

/// Writes `data` to `path` through a sibling temp file and a rename, so a
/// reader never observes a half-written file.
pub(crate) fn write_atomic(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".valkit-")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Writes a file with an explicit mode, truncating any previous content.
pub(crate) fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(data)?;
    // `mode` only applies on creation.
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Removes a file, treating "already gone" as success.
pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Removes whatever is at `path` (file, symlink or directory tree).
pub(crate) fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Free bytes on the filesystem holding `path`. Walks up to the nearest
/// existing ancestor so callers can ask about directories not created yet.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let mut probe: PathBuf = path.to_path_buf();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => probe = parent.to_path_buf(),
            _ => {
                probe = PathBuf::from(".");
                break;
            }
        }
    }
    fs2::available_space(&probe)
}

/// Fails with `PreconditionFailed` unless `path`'s filesystem has `needed`
/// free bytes.
pub(crate) fn ensure_free_space(path: &Path, needed: u64, purpose: &str) -> Result<()> {
    let free = available_space(path)
        .map_err(|e| Error::io(format!("check free space at {}", path.display()), e))?;
    if free < needed {
        return Err(Error::precondition(format!(
            "not enough disk space for {purpose} at {}: need {}, have {}",
            path.display(),
            format_bytes(needed),
            format_bytes(free),
        )));
    }
    Ok(())
}

/// Human-readable byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Moves every entry of `src` into `dst`, replacing same-named entries.
/// Falls back to a mode-preserving copy when a rename crosses filesystems.
pub(crate) fn move_tree_contents(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        remove_any(&to)?;
        if fs::rename(&from, &to).is_err() {
            copy_tree(&from, &to)?;
            remove_any(&from)?;
        }
    }
    Ok(())
}

/// Recursively copies `src` to `dst`, preserving permission bits and
/// recreating symlinks as symlinks.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)?;
    } else if file_type.is_dir() {
        create_dir_all_mode(dst, meta.permissions().mode() & 0o7777)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        fs::set_permissions(dst, meta.permissions())?;
    } else {
        fs::copy(src, dst)?;
        fs::set_permissions(dst, meta.permissions())?;
    }
    Ok(())
}
