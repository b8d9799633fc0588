//! # Self-Update
//!
//! Keeps the `valkit` binary current from a release index of the form
//! `{tag_name, assets: [{name, browser_download_url, size, content_type}]}`.
//!
//! An update is: compare versions, resolve `valkit_<ver>_<os>_<arch>.tar.gz`
//! and `checksums.txt`, download, verify SHA-256, pull the `valkit` entry out
//! of the archive, then swap it in. The swap copies the running binary to
//! `<path>.backup`, writes the new bytes to a temp file beside it with the old
//! permission bits and renames over the original. A failed swap leaves no
//! temp file behind; [`rollback`] puts the backup back.
//!
//! The last check is remembered in `<home>/.update-check` for ten minutes.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use reqwest::Client;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RELEASE_CHECKSUMS, RELEASE_INDEX_URL, RPC_TIMEOUT, TOOL_NAME, TOOL_VERSION, UPDATE_CHECK_TTL};
use crate::error::{Error, ErrorCode, Result};
use crate::fsutil::write_atomic;
use crate::integrity::{checksum_for_name, checksums_match, sha256_of_file};
use crate::snapshot::download::download_with_retry;
use crate::snapshot::{DownloadProgress, RetryPolicy};

// ---------------------------------------------------------------------------
// Release Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    /// Tag without the leading `v`.
    pub fn version(&self) -> &str {
        strip_v(&self.tag_name)
    }

    pub fn asset(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| a.name == name)
    }
}

fn strip_v(version: &str) -> &str {
    let v = version.trim();
    v.strip_prefix('v').unwrap_or(v)
}

/// Whether `latest` should replace `current`.
///
/// A current version that is not semver (a `dev` build) always updates. A
/// latest tag that is not semver never does.
pub fn needs_update(current: &str, latest: &str) -> bool {
    let Ok(latest) = Version::parse(strip_v(latest)) else {
        return false;
    };
    match Version::parse(strip_v(current)) {
        Ok(current) => latest > current,
        Err(_) => true,
    }
}

/// `valkit_1.4.0_linux_amd64.tar.gz`
pub fn asset_name(tool: &str, version: &str, os: &str, arch: &str) -> String {
    format!("{tool}_{}_{os}_{arch}.tar.gz", strip_v(version))
}

/// Host `(os, arch)` in release naming: `amd64` and `arm64` rather than
/// Rust's target names.
pub fn platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    (std::env::consts::OS, arch)
}

// ---------------------------------------------------------------------------
// Check Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheck {
    pub checked_at: DateTime<Utc>,
    pub latest_version: String,
    pub update_available: bool,
}

impl UpdateCheck {
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.checked_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age >= chrono::Duration::zero() && age < ttl,
            Err(_) => false,
        }
    }

    /// Reads a cached check. Missing or unparsable files read as `None`.
    pub fn load(path: &Path) -> Option<Self> {
        let data = fs::read(path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(check) => Some(check),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ignoring unreadable update cache");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::wrap(ErrorCode::GeneralError, "encode update cache", e))?;
        write_atomic(path, &data, 0o644).map_err(|e| Error::io(format!("write {}", path.display()), e))
    }
}

// ---------------------------------------------------------------------------
// Install / Rollback
// ---------------------------------------------------------------------------

/// `<path>.backup`
pub fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

/// Returns the first regular file in a `tar.gz` whose base name is `binary`.
pub fn extract_binary<R: Read>(reader: R, binary: &str) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let bad = |e: std::io::Error| Error::wrap(ErrorCode::ValidationError, "read release archive", e);
    for entry in archive.entries().map_err(bad)? {
        let mut entry = entry.map_err(bad)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(bad)?;
        if path.file_name().and_then(|n| n.to_str()) != Some(binary) {
            continue;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes).map_err(bad)?;
        return Ok(bytes);
    }
    Err(Error::validation(format!("release archive has no `{binary}` binary")))
}

/// Atomically replaces `target` with `bytes`, keeping a backup. Returns the
/// backup path.
pub fn install_binary(target: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let io = |what: &str, path: &Path| {
        let context = format!("{what} {}", path.display());
        move |e: std::io::Error| Error::io(context, e)
    };
    let mode = fs::metadata(target)
        .map_err(io("stat", target))?
        .permissions()
        .mode()
        & 0o7777;
    let backup = backup_path(target);
    fs::copy(target, &backup).map_err(io("back up", target))?;

    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    // Dropping the temp file on any error below deletes it.
    let mut tmp = tempfile::Builder::new()
        .prefix(".valkit-update-")
        .tempfile_in(dir)
        .map_err(io("create temp file in", dir))?;
    tmp.write_all(bytes).map_err(io("write", tmp.path()))?;
    tmp.as_file().sync_all().map_err(io("sync", tmp.path()))?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode)).map_err(io("chmod", tmp.path()))?;
    tmp.persist(target).map_err(|e| Error::io(format!("replace {}", target.display()), e.error))?;
    info!(target = %target.display(), backup = %backup.display(), "binary replaced");
    Ok(backup)
}

/// Moves `<path>.backup` back over `target`.
pub fn rollback(target: &Path) -> Result<()> {
    let backup = backup_path(target);
    if !backup.exists() {
        return Err(Error::precondition(format!("no backup found at {}", backup.display())));
    }
    fs::rename(&backup, target).map_err(|e| Error::io(format!("restore {}", backup.display()), e))?;
    info!(target = %target.display(), "rolled back to previous binary");
    Ok(())
}

// ---------------------------------------------------------------------------
// Updater
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct UpdateOptions {
    pub index_url: String,
    pub current_version: String,
    pub binary_name: String,
    pub os: String,
    pub arch: String,
    /// Where to remember the last check. `None` disables the cache.
    pub check_file: Option<PathBuf>,
    pub check_ttl: Duration,
    /// Deadline for the index and manifest requests.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub progress: Option<DownloadProgress>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        let (os, arch) = platform();
        Self {
            index_url: RELEASE_INDEX_URL.to_string(),
            current_version: TOOL_VERSION.to_string(),
            binary_name: TOOL_NAME.to_string(),
            os: os.to_string(),
            arch: arch.to_string(),
            check_file: None,
            check_ttl: UPDATE_CHECK_TTL,
            request_timeout: RPC_TIMEOUT * 6,
            retry: RetryPolicy::default(),
            progress: None,
        }
    }
}

impl std::fmt::Debug for UpdateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOptions")
            .field("index_url", &self.index_url)
            .field("current_version", &self.current_version)
            .field("platform", &format_args!("{}/{}", self.os, self.arch))
            .field("check_file", &self.check_file)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    pub current: String,
    pub latest: String,
    pub update_available: bool,
    /// Answered from `.update-check` without touching the network.
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { version: String },
    Updated { from: String, to: String, backup: PathBuf },
}

pub struct Updater {
    http: Client,
    options: UpdateOptions,
}

impl Updater {
    pub fn new(options: UpdateOptions) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("{TOOL_NAME}/{TOOL_VERSION}"))
            .build()
            .map_err(|e| Error::wrap(ErrorCode::GeneralError, "build HTTP client", e))?;
        Ok(Self { http, options })
    }

    pub fn options(&self) -> &UpdateOptions {
        &self.options
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let net = |e| Error::wrap(ErrorCode::NetworkError, format!("GET {url}"), e);
        let response = self
            .http
            .get(url)
            .timeout(self.options.request_timeout)
            .send()
            .await
            .map_err(net)?;
        if !response.status().is_success() {
            return Err(Error::network(format!("HTTP {} from {url}", response.status())));
        }
        response.text().await.map_err(net)
    }

    pub async fn latest_release(&self) -> Result<Release> {
        let body = self.get_text(&self.options.index_url).await?;
        serde_json::from_str(&body).map_err(|e| {
            Error::wrap(
                ErrorCode::NetworkError,
                format!("malformed release index at {}", self.options.index_url),
                e,
            )
        })
    }

    fn remember(&self, latest: &str, update_available: bool) {
        let Some(path) = &self.options.check_file else { return };
        let check = UpdateCheck {
            checked_at: Utc::now(),
            latest_version: latest.to_string(),
            update_available,
        };
        if let Err(e) = check.save(path) {
            warn!(error = %e, "could not cache update check");
        }
    }

    /// Compares against the latest release, using a fresh cached answer
    /// unless `force` is set.
    pub async fn check(&self, force: bool) -> Result<UpdateStatus> {
        let current = self.options.current_version.clone();
        if !force {
            let cached = self.options.check_file.as_deref().and_then(UpdateCheck::load);
            if let Some(check) = cached.filter(|c| c.is_fresh(self.options.check_ttl, Utc::now())) {
                debug!(latest = %check.latest_version, "update check answered from cache");
                return Ok(UpdateStatus {
                    update_available: needs_update(&current, &check.latest_version),
                    latest: check.latest_version,
                    current,
                    cached: true,
                });
            }
        }
        let release = self.latest_release().await?;
        let latest = release.version().to_string();
        let update_available = needs_update(&current, &latest);
        self.remember(&latest, update_available);
        Ok(UpdateStatus {
            current,
            latest,
            update_available,
            cached: false,
        })
    }

    /// Downloads, verifies and installs the latest release over `target`.
    pub async fn update(&self, target: &Path, cancel: &CancellationToken) -> Result<UpdateOutcome> {
        let opts = &self.options;
        let release = self.latest_release().await?;
        let latest = release.version().to_string();
        if !needs_update(&opts.current_version, &latest) {
            self.remember(&latest, false);
            return Ok(UpdateOutcome::UpToDate {
                version: opts.current_version.clone(),
            });
        }

        let name = asset_name(&opts.binary_name, &latest, &opts.os, &opts.arch);
        let asset = release.asset(&name).ok_or_else(|| {
            Error::precondition(format!(
                "release {} has no asset {name} for {}/{}",
                release.tag_name, opts.os, opts.arch
            ))
        })?;
        let manifest_asset = release.asset(RELEASE_CHECKSUMS).ok_or_else(|| {
            Error::validation(format!("release {} has no {RELEASE_CHECKSUMS}", release.tag_name))
        })?;
        let manifest = self.get_text(&manifest_asset.browser_download_url).await?;
        let expected = checksum_for_name(&manifest, &name)
            .ok_or_else(|| Error::validation(format!("{RELEASE_CHECKSUMS} has no entry for {name}")))?;

        let staging = tempfile::tempdir().map_err(|e| Error::io("create staging directory", e))?;
        let archive = staging.path().join(&name);
        info!(version = %latest, asset = %name, size = asset.size, "downloading release");
        download_with_retry(
            &self.http,
            &asset.browser_download_url,
            &archive,
            &opts.retry,
            opts.progress.as_ref(),
            cancel,
        )
        .await?;

        let binary_name = opts.binary_name.clone();
        let target_path = target.to_path_buf();
        let backup = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let actual = sha256_of_file(&archive).map_err(|e| Error::io(format!("hash {}", archive.display()), e))?;
            if !checksums_match(&actual, &expected) {
                return Err(Error::validation(format!(
                    "checksum mismatch for {}: expected {expected}, got {actual}",
                    archive.display()
                )));
            }
            let file = fs::File::open(&archive).map_err(|e| Error::io(format!("open {}", archive.display()), e))?;
            let bytes = extract_binary(std::io::BufReader::new(file), &binary_name)?;
            install_binary(&target_path, &bytes)
        })
        .await
        .map_err(|e| Error::wrap(ErrorCode::GeneralError, "install task failed", e))??;

        self.remember(&latest, false);
        Ok(UpdateOutcome::Updated {
            from: opts.current_version.clone(),
            to: latest,
            backup,
        })
    }
}
