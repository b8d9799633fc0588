//! Resumable HTTP download with bounded, cancellable retries.
//!
//! One attempt against the tarball URL:
//!
//! | Partial on disk | Server reply | Action                                   |
//! |-----------------|--------------|------------------------------------------|
//! | `s > 0` bytes   | 206          | append; total = `s + Content-Length`     |
//! | any             | 200          | truncate and write from byte 0           |
//! | `s > 0` bytes   | 416          | delete partial, re-request without Range |
//! | any             | other        | attempt fails                            |
//!
//! Failed attempts back off exponentially (2s, 4s, 8s, capped at 30s).
//! Cancellation is never retried.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DOWNLOAD_ATTEMPTS, DOWNLOAD_INITIAL_BACKOFF, DOWNLOAD_MAX_BACKOFF};
use crate::error::{Error, ErrorCode, Result};

/// Progress callback: `(current_bytes, total_bytes)`, total `-1` if unknown.
pub type DownloadProgress = Arc<dyn Fn(i64, i64) + Send + Sync>;

/// No byte for this long fails the attempt.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempt count and backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Longest wait for the next chunk of a response body.
    pub stall_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DOWNLOAD_ATTEMPTS,
            initial_backoff: DOWNLOAD_INITIAL_BACKOFF,
            max_backoff: DOWNLOAD_MAX_BACKOFF,
            stall_timeout: STALL_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed`-th failed attempt (1-based).
    pub fn backoff(&self, failed: u32) -> Duration {
        let factor = 1u32 << failed.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
pub(crate) async fn cancellable_sleep(delay: Duration, cancel: &CancellationToken, what: &str) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled(what)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Downloads `url` into `partial`, resuming from whatever is already there.
pub(crate) async fn download_with_retry(
    http: &Client,
    url: &str,
    partial: &Path,
    policy: &RetryPolicy,
    progress: Option<&DownloadProgress>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::cancelled("snapshot download")),
            r = fetch_once(http, url, partial, policy, progress) => r,
        };
        match result {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(attempt, attempts, error = %e.chain_string(), "snapshot download attempt failed");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            let delay = policy.backoff(attempt);
            debug!(?delay, "backing off before next download attempt");
            cancellable_sleep(delay, cancel, "snapshot download").await?;
        }
    }

    let cause = last_error.unwrap_or_else(|| Error::general("no download attempt was made"));
    Err(Error::wrap(
        ErrorCode::NetworkError,
        format!("download {url} failed after {attempts} attempts"),
        cause,
    ))
}

fn net_err(context: String) -> impl FnOnce(reqwest::Error) -> Error {
    move |e| Error::wrap(ErrorCode::NetworkError, context, e)
}

fn header_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// One attempt. Returns the size of the partial file when the body ends.
async fn fetch_once(
    http: &Client,
    url: &str,
    partial: &Path,
    policy: &RetryPolicy,
    progress: Option<&DownloadProgress>,
) -> Result<u64> {
    let existing = tokio::fs::metadata(partial).await.map(|m| m.len()).unwrap_or(0);

    let mut request = http.get(url);
    if existing > 0 {
        request = request.header(RANGE, format!("bytes={existing}-"));
    }
    let mut response = request.send().await.map_err(net_err(format!("GET {url}")))?;

    let (mut file, mut current, total) = match response.status() {
        StatusCode::PARTIAL_CONTENT if existing > 0 => {
            let file = OpenOptions::new()
                .append(true)
                .open(partial)
                .await
                .map_err(|e| Error::io(format!("open {}", partial.display()), e))?;
            let total = header_length(&response).map_or(-1, |len| (existing + len) as i64);
            debug!(resume_from = existing, "server accepted range request");
            (file, existing, total)
        }
        StatusCode::OK => {
            let file = create_truncated(partial).await?;
            (file, 0, header_length(&response).map_or(-1, |len| len as i64))
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            debug!("range not satisfiable, restarting from byte 0");
            tokio::fs::remove_file(partial)
                .await
                .map_err(|e| Error::io(format!("remove {}", partial.display()), e))?;
            response = http
                .get(url)
                .send()
                .await
                .map_err(net_err(format!("GET {url}")))?;
            if response.status() != StatusCode::OK {
                return Err(Error::network(format!(
                    "unexpected HTTP status {} for {url} after range reset",
                    response.status()
                )));
            }
            let file = create_truncated(partial).await?;
            (file, 0, header_length(&response).map_or(-1, |len| len as i64))
        }
        status => {
            return Err(Error::network(format!("unexpected HTTP status {status} for {url}")));
        }
    };

    if let Some(report) = progress {
        report(current as i64, total);
    }

    loop {
        let chunk = tokio::time::timeout(policy.stall_timeout, response.chunk())
            .await
            .map_err(|_| Error::network(format!("download of {url} stalled")))?
            .map_err(net_err(format!("read body of {url}")))?;
        let Some(chunk) = chunk else { break };
        file.write_all(&chunk)
            .await
            .map_err(|e| Error::io(format!("write {}", partial.display()), e))?;
        current += chunk.len() as u64;
        if let Some(report) = progress {
            report(current as i64, total);
        }
    }

    file.flush()
        .await
        .map_err(|e| Error::io(format!("flush {}", partial.display()), e))?;
    file.sync_all()
        .await
        .map_err(|e| Error::io(format!("sync {}", partial.display()), e))?;

    if total >= 0 && current as i64 != total {
        return Err(Error::network(format!(
            "short body for {url}: got {current} of {total} bytes"
        )));
    }
    Ok(current)
}

async fn create_truncated(path: &Path) -> Result<File> {
    File::create(path)
        .await
        .map_err(|e| Error::io(format!("create {}", path.display()), e))
}
