//! # Safe Archive Extraction
//!
//! Snapshots arrive as `tar` streams inside an `lz4` frame. An archive is
//! untrusted input: a hostile (or merely sloppy) publisher can name entries
//! `../../etc/passwd`, plant absolute symlinks, or point a link somewhere and
//! then write "through" it. Every entry is therefore vetted before anything
//! touches disk:
//!
//! 1. The name is normalized lexically (`.`/`..` collapsed, forward slashes).
//! 2. A name that is absolute or climbs above the root is rejected.
//! 3. The joined target must still sit below the normalized destination.
//! 4. No already-extracted symlink may sit between the destination and the
//!    target, so a relative link cannot be used as a springboard.
//!
//! Regular files, directories, symlinks (relative only) and hardlinks are
//! materialized with their header modes. Device nodes, FIFOs and other exotic
//! types are skipped silently.

use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tar::EntryType;
use tracing::debug;

use crate::error::{Error, ErrorCode};
use crate::fsutil::{create_dir_all_mode, remove_any};

/// Errors raised while unpacking an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The entry name escapes the destination directory.
    #[error("invalid path in archive (path traversal): {0}")]
    InvalidPath(String),

    /// A symlink entry points at an absolute location.
    #[error("refusing absolute symlink in archive: {name} -> {target}")]
    AbsoluteSymlink { name: String, target: String },

    /// Fewer bytes were written than the header promised.
    #[error("incomplete extraction of {name}: wrote {written} of {expected} bytes")]
    IncompleteExtraction {
        name: String,
        written: u64,
        expected: u64,
    },

    /// Reading the stream or writing the destination failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<ArchiveError> for Error {
    fn from(err: ArchiveError) -> Self {
        let code = match err {
            ArchiveError::Io { .. } => ErrorCode::GeneralError,
            _ => ErrorCode::ValidationError,
        };
        Error::wrap(code, format!("snapshot extraction failed: {err}"), err)
    }
}

/// Progress callback: `(entries_so_far, total, entry_name)`. The total is
/// always `-1` because a tar stream does not announce its length.
pub type ExtractProgress<'a> = &'a mut dyn FnMut(u64, i64, &str);

/// Lexically normalizes a slash-separated archive path. Backslashes are
/// treated as separators. Mirrors the classic `path.Clean` rules: an empty
/// result becomes `.`, and `..` above a relative root is preserved.
pub fn clean_path(name: &str) -> String {
    let name = name.replace('\\', "/");
    let rooted = name.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Validates an entry name and returns `(clean_name, target_path)`.
///
/// `Ok(None)` means the entry names the destination root itself.
fn sanitize(dest: &Path, clean_dest: &str, raw: &str) -> Result<Option<(String, PathBuf)>, ArchiveError> {
    let clean = clean_path(raw);
    if clean == "." {
        return Ok(None);
    }
    if clean.starts_with('/') || clean == ".." || clean.starts_with("../") {
        return Err(ArchiveError::InvalidPath(raw.to_string()));
    }
    let target = dest.join(&clean);
    let prefix = format!("{}/", clean_dest.trim_end_matches('/'));
    if !clean_path(&target.to_string_lossy()).starts_with(&prefix) {
        return Err(ArchiveError::InvalidPath(raw.to_string()));
    }
    Ok(Some((clean, target)))
}

/// Refuses to write below a symlink planted by an earlier entry.
fn ensure_no_symlink_ancestor(dest: &Path, clean: &str) -> Result<(), ArchiveError> {
    let mut current = dest.to_path_buf();
    let segments: Vec<&str> = clean.split('/').collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        current.push(segment);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ArchiveError::InvalidPath(clean.to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(ArchiveError::io(format!("stat {}", current.display()), e)),
        }
    }
    Ok(())
}

fn ensure_parent(target: &Path) -> Result<(), ArchiveError> {
    if let Some(parent) = target.parent() {
        create_dir_all_mode(parent, 0o755)
            .map_err(|e| ArchiveError::io(format!("create {}", parent.display()), e))?;
    }
    Ok(())
}

/// Extracts a `tar.lz4` stream into `dest`. Returns the number of entries
/// processed (including skipped ones).
pub fn extract_tar_lz4<R: Read>(
    reader: R,
    dest: &Path,
    progress: Option<ExtractProgress<'_>>,
) -> Result<u64, ArchiveError> {
    extract_tar(lz4_flex::frame::FrameDecoder::new(reader), dest, progress)
}

/// Extracts a plain `tar` stream into `dest` with the safety rules above.
pub fn extract_tar<R: Read>(
    reader: R,
    dest: &Path,
    mut progress: Option<ExtractProgress<'_>>,
) -> Result<u64, ArchiveError> {
    create_dir_all_mode(dest, 0o755)
        .map_err(|e| ArchiveError::io(format!("create {}", dest.display()), e))?;
    let clean_dest = clean_path(&dest.to_string_lossy());

    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::io("read archive", e))?;

    let mut count = 0u64;
    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::io("read archive entry", e))?;
        let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some((clean, target)) = sanitize(dest, &clean_dest, &raw_name)? else {
            count += 1;
            continue;
        };
        ensure_no_symlink_ancestor(dest, &clean)?;

        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644) & 0o7777;
        let entry_type = header.entry_type();

        match entry_type {
            EntryType::Regular | EntryType::Continuous => {
                let expected = header
                    .size()
                    .map_err(|e| ArchiveError::io(format!("read size of {clean}"), e))?;
                ensure_parent(&target)?;
                remove_any(&target)
                    .map_err(|e| ArchiveError::io(format!("replace {clean}"), e))?;
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(mode)
                    .open(&target)
                    .map_err(|e| ArchiveError::io(format!("create {clean}"), e))?;
                let written = io::copy(&mut entry, &mut file)
                    .map_err(|e| ArchiveError::io(format!("write {clean}"), e))?;
                if expected > 0 && written != expected {
                    return Err(ArchiveError::IncompleteExtraction {
                        name: clean,
                        written,
                        expected,
                    });
                }
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .map_err(|e| ArchiveError::io(format!("chmod {clean}"), e))?;
            }
            EntryType::Directory => {
                create_dir_all_mode(&target, mode)
                    .map_err(|e| ArchiveError::io(format!("create {clean}"), e))?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .map_err(|e| ArchiveError::io(format!("chmod {clean}"), e))?;
            }
            EntryType::Symlink => {
                let link: PathBuf = link_name(&entry, &clean)?;
                if link.is_absolute() {
                    return Err(ArchiveError::AbsoluteSymlink {
                        name: clean,
                        target: link.display().to_string(),
                    });
                }
                ensure_parent(&target)?;
                remove_any(&target)
                    .map_err(|e| ArchiveError::io(format!("replace {clean}"), e))?;
                std::os::unix::fs::symlink(&link, &target)
                    .map_err(|e| ArchiveError::io(format!("symlink {clean}"), e))?;
            }
            EntryType::Link => {
                let link = link_name(&entry, &clean)?;
                let Some((_, source)) = sanitize(dest, &clean_dest, &link.to_string_lossy())?
                else {
                    return Err(ArchiveError::InvalidPath(link.display().to_string()));
                };
                ensure_parent(&target)?;
                remove_any(&target)
                    .map_err(|e| ArchiveError::io(format!("replace {clean}"), e))?;
                fs::hard_link(&source, &target)
                    .map_err(|e| ArchiveError::io(format!("hardlink {clean}"), e))?;
            }
            other => {
                debug!(entry = %clean, kind = ?other, "skipping unsupported archive entry");
            }
        }

        count += 1;
        if let Some(report) = progress.as_mut() {
            report(count, -1, &clean);
        }
    }
    Ok(count)
}

fn link_name<R: Read>(entry: &tar::Entry<'_, R>, clean: &str) -> Result<PathBuf, ArchiveError> {
    let link: Option<Cow<'_, Path>> = entry
        .link_name()
        .map_err(|e| ArchiveError::io(format!("read link target of {clean}"), e))?;
    link.map(Cow::into_owned)
        .ok_or_else(|| ArchiveError::InvalidPath(format!("{clean} (missing link target)")))
}
