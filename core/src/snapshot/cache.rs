//! Content-addressed cache holding exactly one snapshot tarball.
//!
//! ```text
//! snapshot-cache/
//!   latest.tar.lz4                 cached archive
//!   latest.tar.lz4.sha256          remote checksum recorded at download time
//!   latest.tar.lz4.partial         in-progress download
//!   latest.tar.lz4.partial.sha256  remote checksum the partial belongs to
//! ```
//!
//! The cache's identity is the remote checksum. A cache is valid when the
//! tarball exists and the recorded checksum equals the one the remote
//! currently publishes. The partial file is never mistaken for the tarball.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{HomeLayout, SNAPSHOT_CHECKSUM, SNAPSHOT_TARBALL};
use crate::fsutil::{create_dir_all_mode, remove_file_if_exists, write_atomic};
use crate::integrity::checksums_match;

/// What `reconcile_partial` decided about a leftover partial download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialState {
    /// No partial file on disk.
    Absent,
    /// The partial belongs to the current remote version, or predates the
    /// sidecar marker (`verified == false`); resume from `bytes`.
    Resume { bytes: u64, verified: bool },
    /// The partial belonged to an older snapshot and was deleted.
    Discarded,
}

/// Read-only view of the cache for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatus {
    pub tarball_bytes: Option<u64>,
    pub stored_checksum: Option<String>,
    pub partial_bytes: Option<u64>,
    pub partial_checksum: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotCache {
    dir: PathBuf,
}

impl SnapshotCache {
    /// Cache rooted at `<home>/snapshot-cache`.
    pub fn new(home: &Path) -> Self {
        Self {
            dir: HomeLayout::new(home).snapshot_cache_dir(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tarball_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_TARBALL)
    }

    pub fn checksum_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_CHECKSUM)
    }

    pub fn partial_path(&self) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_TARBALL}.partial"))
    }

    pub fn partial_checksum_path(&self) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_TARBALL}.partial.sha256"))
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        create_dir_all_mode(&self.dir, 0o755)
    }

    /// Checksum recorded by the last successful download.
    pub fn stored_checksum(&self) -> Option<String> {
        read_trimmed(&self.checksum_path())
    }

    /// True when the tarball exists and its recorded checksum equals `remote`.
    pub fn is_valid(&self, remote: &str) -> bool {
        if !self.tarball_path().is_file() {
            return false;
        }
        self.stored_checksum()
            .is_some_and(|stored| checksums_match(&stored, remote))
    }

    /// Decides what to do with a leftover partial download before a new
    /// attempt at `remote`.
    pub fn reconcile_partial(&self, remote: &str) -> io::Result<PartialState> {
        let partial = self.partial_path();
        let bytes = match fs::metadata(&partial) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PartialState::Absent),
            Err(e) => return Err(e),
        };
        match read_trimmed(&self.partial_checksum_path()) {
            Some(marker) if checksums_match(&marker, remote) => {
                debug!(bytes, "resuming partial snapshot download");
                Ok(PartialState::Resume {
                    bytes,
                    verified: true,
                })
            }
            Some(marker) => {
                info!(old = %marker, new = %remote, "remote snapshot changed, discarding partial download");
                self.discard_partial()?;
                Ok(PartialState::Discarded)
            }
            None => {
                debug!(bytes, "partial download has no marker, resuming optimistically");
                Ok(PartialState::Resume {
                    bytes,
                    verified: false,
                })
            }
        }
    }

    /// Records which remote checksum the partial file is for. Written before
    /// any byte is downloaded.
    pub fn write_partial_marker(&self, remote: &str) -> io::Result<()> {
        write_atomic(&self.partial_checksum_path(), remote.as_bytes(), 0o644)
    }

    /// Deletes the partial file and its marker.
    pub fn discard_partial(&self) -> io::Result<()> {
        remove_file_if_exists(&self.partial_path())?;
        remove_file_if_exists(&self.partial_checksum_path())
    }

    /// Drops the recorded checksum so the tarball no longer counts as cached.
    pub fn invalidate(&self) -> io::Result<()> {
        remove_file_if_exists(&self.checksum_path())
    }

    /// Renames the completed partial over the tarball.
    pub fn promote_partial(&self) -> io::Result<()> {
        fs::rename(self.partial_path(), self.tarball_path())
    }

    pub fn store_checksum(&self, checksum: &str) -> io::Result<()> {
        write_atomic(&self.checksum_path(), checksum.as_bytes(), 0o644)?;
        remove_file_if_exists(&self.partial_checksum_path())
    }

    /// Removes tarball and recorded checksum.
    pub fn clear(&self) -> io::Result<()> {
        remove_file_if_exists(&self.tarball_path())?;
        remove_file_if_exists(&self.checksum_path())
    }

    pub fn status(&self) -> CacheStatus {
        CacheStatus {
            tarball_bytes: fs::metadata(self.tarball_path()).ok().map(|m| m.len()),
            stored_checksum: self.stored_checksum(),
            partial_bytes: fs::metadata(self.partial_path()).ok().map(|m| m.len()),
            partial_checksum: read_trimmed(&self.partial_checksum_path()),
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
