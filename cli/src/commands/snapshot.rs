use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

use valkit_core::process::{PidFileSupervisor, ProcessSupervisor};
use valkit_core::snapshot::{DownloadOptions, DownloadProgress, ExtractProgressFn, SnapshotCache, SnapshotService};
use valkit_core::{format_bytes, Error};

use super::Context;
use crate::cli::{SnapshotCommand, SnapshotDownloadArgs, SnapshotExtractArgs, SnapshotStatusArgs};

const PROGRESS_EVERY: Duration = Duration::from_secs(2);

pub async fn run(ctx: &Context, command: SnapshotCommand) -> Result<()> {
    match command {
        SnapshotCommand::Download(args) => download(ctx, args).await,
        SnapshotCommand::Extract(args) => extract(ctx, args).await,
        SnapshotCommand::Status(args) => status(ctx, args).await,
    }
}

/// Throttled `current / total` progress on stderr.
fn download_progress() -> DownloadProgress {
    let last = Mutex::new(None::<Instant>);
    Arc::new(move |current: i64, total: i64| {
        let mut last = last.lock();
        let due = last.map_or(true, |at| at.elapsed() >= PROGRESS_EVERY) || (total > 0 && current >= total);
        if !due {
            return;
        }
        *last = Some(Instant::now());
        let current = format_bytes(current.max(0) as u64);
        if total > 0 {
            eprintln!("downloaded {current} / {}", format_bytes(total as u64));
        } else {
            eprintln!("downloaded {current}");
        }
    })
}

async fn download(ctx: &Context, args: SnapshotDownloadArgs) -> Result<()> {
    let service = SnapshotService::new()?;
    let options = DownloadOptions {
        no_cache: args.no_cache,
        progress: Some(download_progress()),
    };
    let cancel = super::shutdown_token();
    let outcome = service
        .download(&args.url, ctx.home(), &options, &cancel)
        .await
        .context("snapshot download failed")?;

    if outcome.cache_hit {
        println!("Snapshot cache is current ({})", format_bytes(outcome.bytes));
    } else {
        println!("Snapshot downloaded ({})", format_bytes(outcome.bytes));
    }
    println!("  sha256: {}", outcome.checksum);
    Ok(())
}

async fn extract(ctx: &Context, args: SnapshotExtractArgs) -> Result<()> {
    let supervisor = PidFileSupervisor::new(ctx.home(), &ctx.node_bin);
    if let Some(pid) = supervisor.pid() {
        return Err(Error::precondition(format!("node is running (pid {pid}); stop it before extracting")).into());
    }
    let target = args.target.unwrap_or_else(|| ctx.layout.data_dir());
    let mut last = None::<Instant>;
    let progress: ExtractProgressFn = Box::new(move |entries: u64, _total: i64, name: &str| {
        if last.map_or(true, |at: Instant| at.elapsed() >= PROGRESS_EVERY) {
            last = Some(Instant::now());
            eprintln!("extracted {entries} entries ({name})");
        }
    });

    let report = SnapshotService::new()?
        .extract(ctx.home(), &target, Some(progress))
        .await
        .context("snapshot extraction failed")?;
    info!(entries = report.entries, target = %target.display(), "snapshot extracted");
    println!("Extracted {} entries into {}", report.entries, target.display());
    if report.preserved_signing_state {
        println!("  priv_validator_state.json preserved");
    }
    Ok(())
}

async fn status(ctx: &Context, args: SnapshotStatusArgs) -> Result<()> {
    let cache = SnapshotCache::new(ctx.home());
    let status = cache.status();
    println!("Snapshot cache: {}", cache.dir().display());
    match status.tarball_bytes {
        Some(bytes) => println!("  tarball : {}", format_bytes(bytes)),
        None => println!("  tarball : none"),
    }
    println!("  sha256  : {}", status.stored_checksum.as_deref().unwrap_or("none"));
    if let Some(bytes) = status.partial_bytes {
        let owner = status.partial_checksum.as_deref().unwrap_or("unknown version");
        println!("  partial : {} ({owner})", format_bytes(bytes));
    }

    if let Some(url) = args.url {
        let remote = SnapshotService::new()?
            .remote_checksum(&url)
            .await
            .context("fetch remote checksum")?;
        let current = cache.is_valid(&remote);
        println!("  remote  : {remote}");
        println!("  current : {}", if current { "yes" } else { "no" });
    }
    Ok(())
}
