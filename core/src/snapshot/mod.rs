//! # Snapshot Service
//!
//! Fast-start for a fresh node: fetch a `tar.lz4` archive of chain data from a
//! snapshot host, keep it in a content-addressed cache, and install it into
//! the node's data directory without ever losing `priv_validator_state.json`.
//!
//! ## Download
//!
//! 1. Fetch `<base>/latest.tar.lz4.sha256` and parse the manifest.
//! 2. Cache hit (unless `no_cache`) ends the call without touching the tarball.
//! 3. HEAD the tarball for its size and preflight free space.
//! 4. Reconcile any partial download, then record which checksum it is for.
//! 5. Resumable download with bounded retries (see [`download`]).
//! 6. Verify SHA-256 against the manifest and record it.
//!
//! ## Extract
//!
//! The cached tarball is re-verified, unpacked into a staging directory under
//! the home, and its `data/` tree replaces the target directory. The signing
//! state file is buffered in memory before the target is cleared and written
//! back afterwards with mode `0600`.

pub mod cache;
pub mod download;

use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::cache::{CacheStatus, PartialState, SnapshotCache};
pub use self::download::{DownloadProgress, RetryPolicy};

use crate::archive::extract_tar_lz4;
use crate::config::{EXTRACT_SPACE_FACTOR, SNAPSHOT_CHECKSUM, SNAPSHOT_TARBALL, TOOL_NAME, TOOL_VERSION};
use crate::error::{Error, ErrorCode, Result};
use crate::fsutil::{create_dir_all_mode, ensure_free_space, format_bytes, move_tree_contents, remove_any, write_with_mode};
use crate::integrity::{checksums_match, parse_checksum_manifest, sha256_of_file};

/// The one file that survives a data-directory replacement.
pub const PRIV_VALIDATOR_STATE: &str = "priv_validator_state.json";

/// Timeout for small metadata requests (checksum manifest, HEAD).
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Progress callback for extraction: `(entries_done, -1, entry_name)`.
pub type ExtractProgressFn = Box<dyn FnMut(u64, i64, &str) + Send>;

/// Per-call download options.
#[derive(Clone, Default)]
pub struct DownloadOptions {
    /// Ignore a valid cache and download again.
    pub no_cache: bool,
    pub progress: Option<DownloadProgress>,
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("no_cache", &self.no_cache)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Result of [`SnapshotService::download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Remote checksum the cache now holds.
    pub checksum: String,
    /// True when the existing cache was already current.
    pub cache_hit: bool,
    /// Size of the cached tarball.
    pub bytes: u64,
}

/// Result of [`SnapshotService::extract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub entries: u64,
    pub preserved_signing_state: bool,
}

/// Download and install snapshots. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SnapshotService {
    http: Client,
    retry: RetryPolicy,
}

impl SnapshotService {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(format!("{TOOL_NAME}/{TOOL_VERSION}"))
            .build()
            .map_err(|e| Error::wrap(ErrorCode::GeneralError, "build HTTP client", e))?;
        Ok(Self::with_client(http, RetryPolicy::default()))
    }

    pub fn with_client(http: Client, retry: RetryPolicy) -> Self {
        Self { http, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetches and parses `<base>/latest.tar.lz4.sha256`.
    pub async fn remote_checksum(&self, snapshot_url: &str) -> Result<String> {
        let url = format!("{}/{SNAPSHOT_CHECKSUM}", trim_base(snapshot_url));
        let response = self
            .http
            .get(&url)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::wrap(ErrorCode::NetworkError, format!("GET {url}"), e))?;
        if response.status() != StatusCode::OK {
            return Err(Error::network(format!(
                "fetch snapshot checksum: HTTP {} from {url}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::wrap(ErrorCode::NetworkError, format!("read {url}"), e))?;
        parse_checksum_manifest(&body[..])
            .map_err(|e| Error::wrap(ErrorCode::NetworkError, format!("read {url}"), e))?
            .ok_or_else(|| Error::validation(format!("no SHA-256 checksum found in {url}")))
    }

    /// True when the local cache matches what the remote publishes now.
    /// Only the checksum manifest is fetched.
    pub async fn is_cache_valid(&self, snapshot_url: &str, home: &Path) -> Result<bool> {
        let remote = self.remote_checksum(snapshot_url).await?;
        Ok(SnapshotCache::new(home).is_valid(&remote))
    }

    /// Brings the cache up to date with the remote snapshot. Idempotent.
    pub async fn download(
        &self,
        snapshot_url: &str,
        home: &Path,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let base = trim_base(snapshot_url);
        let remote = self.remote_checksum(base).await?;
        let cache = SnapshotCache::new(home);

        if !options.no_cache && cache.is_valid(&remote) {
            let bytes = fs::metadata(cache.tarball_path()).map(|m| m.len()).unwrap_or(0);
            info!(checksum = %remote, "snapshot cache is current, skipping download");
            return Ok(DownloadOutcome {
                checksum: remote,
                cache_hit: true,
                bytes,
            });
        }

        cache
            .ensure_dir()
            .map_err(|e| Error::io(format!("create {}", cache.dir().display()), e))?;

        let tarball_url = format!("{base}/{SNAPSHOT_TARBALL}");
        match self.remote_size(&tarball_url).await {
            Some(size) => {
                debug!(size = %format_bytes(size), "snapshot size");
                ensure_free_space(cache.dir(), size, "snapshot download")?;
            }
            None => warn!(url = %tarball_url, "snapshot size unknown, skipping disk space preflight"),
        }

        let partial = cache
            .reconcile_partial(&remote)
            .map_err(|e| Error::io("inspect partial snapshot download", e))?;
        let optimistic = matches!(partial, PartialState::Resume { verified: false, .. });

        let bytes = match self
            .fetch_verified(&tarball_url, &cache, &remote, options, cancel)
            .await
        {
            Err(e) if optimistic && e.code() == ErrorCode::ValidationError => {
                warn!("resumed legacy partial download failed verification, downloading from scratch");
                cache
                    .discard_partial()
                    .map_err(|e| Error::io("discard partial snapshot download", e))?;
                self.fetch_verified(&tarball_url, &cache, &remote, options, cancel)
                    .await?
            }
            other => other?,
        };

        cache
            .store_checksum(&remote)
            .map_err(|e| Error::io("record snapshot checksum", e))?;
        info!(checksum = %remote, size = %format_bytes(bytes), "snapshot downloaded and verified");
        Ok(DownloadOutcome {
            checksum: remote,
            cache_hit: false,
            bytes,
        })
    }

    /// Downloads into the partial file, promotes it and verifies the result.
    async fn fetch_verified(
        &self,
        tarball_url: &str,
        cache: &SnapshotCache,
        remote: &str,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        cache
            .write_partial_marker(remote)
            .map_err(|e| Error::io("write partial download marker", e))?;

        let bytes = download::download_with_retry(
            &self.http,
            tarball_url,
            &cache.partial_path(),
            &self.retry,
            options.progress.as_ref(),
            cancel,
        )
        .await?;

        // The old tarball stays cached and verifiable until this point.
        cache
            .invalidate()
            .map_err(|e| Error::io("invalidate snapshot cache", e))?;
        cache
            .promote_partial()
            .map_err(|e| Error::io("finalize snapshot download", e))?;

        let actual = hash_file(cache.tarball_path()).await?;
        if !checksums_match(&actual, remote) {
            warn!(expected = %remote, actual = %actual, "snapshot checksum mismatch");
            if let Err(e) = cache.clear() {
                warn!(error = %e, "failed to remove mismatched snapshot");
            }
            if let Err(e) = cache.discard_partial() {
                warn!(error = %e, "failed to remove partial download marker");
            }
            return Err(Error::validation("checksum verification failed"));
        }
        Ok(bytes)
    }

    async fn remote_size(&self, url: &str) -> Option<u64> {
        let response = self
            .http
            .head(url)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response
            .headers()
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Installs the cached snapshot into `target_dir` (normally `<home>/data`).
    /// The node must not be running.
    pub async fn extract(
        &self,
        home: &Path,
        target_dir: &Path,
        progress: Option<ExtractProgressFn>,
    ) -> Result<ExtractReport> {
        let home = home.to_path_buf();
        let target = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || extract_blocking(&home, &target, progress))
            .await
            .map_err(|e| Error::wrap(ErrorCode::GeneralError, "snapshot extraction task failed", e))?
    }
}

fn trim_base(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

async fn hash_file(path: PathBuf) -> Result<String> {
    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || sha256_of_file(&path))
        .await
        .map_err(|e| Error::wrap(ErrorCode::GeneralError, "hash task failed", e))?
        .map_err(|e| Error::io(format!("hash {display}"), e))
}

fn extract_blocking(
    home: &Path,
    target_dir: &Path,
    mut progress: Option<ExtractProgressFn>,
) -> Result<ExtractReport> {
    let cache = SnapshotCache::new(home);
    let tarball = cache.tarball_path();
    let size = match fs::metadata(&tarball) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            return Err(Error::precondition(format!(
                "no cached snapshot at {}; run `{TOOL_NAME} snapshot download` first",
                tarball.display()
            )))
        }
    };

    match cache.stored_checksum() {
        Some(stored) => {
            let actual = sha256_of_file(&tarball)
                .map_err(|e| Error::io(format!("hash {}", tarball.display()), e))?;
            if !checksums_match(&actual, &stored) {
                warn!(expected = %stored, actual = %actual, "cached snapshot is corrupt, removing it");
                if let Err(e) = cache.clear() {
                    warn!(error = %e, path = %tarball.display(), "failed to remove corrupt snapshot");
                }
                return Err(Error::validation(
                    "cached snapshot failed checksum verification and was removed; \
                     download it again with --no-cache",
                ));
            }
        }
        None => warn!("no stored checksum for cached snapshot, extracting without verification"),
    }

    ensure_free_space(
        target_dir,
        size.saturating_mul(EXTRACT_SPACE_FACTOR),
        "snapshot extraction",
    )?;

    let preserved_path = target_dir.join(PRIV_VALIDATOR_STATE);
    let preserved = match fs::read(&preserved_path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(Error::io(format!("read {}", preserved_path.display()), e)),
    };

    create_dir_all_mode(home, 0o755).map_err(|e| Error::io(format!("create {}", home.display()), e))?;
    let staging = tempfile::Builder::new()
        .prefix(".snapshot-extract-")
        .tempdir_in(home)
        .map_err(|e| Error::io("create staging directory", e))?;

    let file = fs::File::open(&tarball).map_err(|e| Error::io(format!("open {}", tarball.display()), e))?;
    let mut report = |done: u64, total: i64, name: &str| {
        if let Some(callback) = progress.as_mut() {
            callback(done, total, name);
        }
    };
    let entries = extract_tar_lz4(BufReader::new(file), staging.path(), Some(&mut report))?;

    let extracted = staging.path().join("data");
    if !extracted.is_dir() {
        return Err(Error::validation("snapshot archive has no data/ directory at its root"));
    }

    create_dir_all_mode(target_dir, 0o755)
        .map_err(|e| Error::io(format!("create {}", target_dir.display()), e))?;
    clear_except(target_dir, PRIV_VALIDATOR_STATE)?;
    move_tree_contents(&extracted, target_dir)
        .map_err(|e| Error::io(format!("install snapshot into {}", target_dir.display()), e))?;

    if let Some(bytes) = &preserved {
        if let Err(e) = write_with_mode(&preserved_path, bytes, 0o600) {
            warn!(error = %e, path = %preserved_path.display(), "failed to restore signing state");
        }
    }

    info!(entries, target = %target_dir.display(), "snapshot installed");
    Ok(ExtractReport {
        entries,
        preserved_signing_state: preserved.is_some(),
    })
}

/// Deletes every top-level entry of `dir` except `keep`.
fn clear_except(dir: &Path, keep: &str) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io(format!("read {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("read {}", dir.display()), e))?;
        if entry.file_name() == keep {
            continue;
        }
        remove_any(&entry.path())
            .map_err(|e| Error::io(format!("remove {}", entry.path().display()), e))?;
    }
    Ok(())
}
