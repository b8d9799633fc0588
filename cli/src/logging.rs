//! # Structured Logging
//!
//! Installs the `tracing` subscriber: `RUST_LOG`-style filtering with a JSON
//! or pretty formatter.
//!
//! Short commands log to stderr so that stdout carries only data (`status
//! --json`, Prometheus text). Long-running screens such as the dashboard own
//! the terminal, so they log to `<home>/logs/valkit.log` instead.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable output.
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    /// Appends to a file, creating parent directories.
    File(PathBuf),
}

/// Installs the global subscriber. `RUST_LOG` overrides `default_level`.
///
/// ```text
/// RUST_LOG=valkit=debug,valkit_core=trace
/// ```
pub fn init_logging(default_level: &str, format: LogFormat, sink: &LogSink) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match sink {
        LogSink::Stderr => install(filter, format, std::io::stderr, true)?,
        LogSink::File(path) => install(filter, format, Arc::new(open_log(path)?), false)?,
    }

    tracing::debug!(?format, ?sink, "logging initialized");
    Ok(())
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create log directory {}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))
}

fn install<W>(filter: EnvFilter, format: LogFormat, writer: W, ansi: bool) -> Result<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(writer).with_target(true))
            .try_init(),
    };
    installed.context("install tracing subscriber")
}

/// Routes panic messages into the log instead of the terminal. Used while a
/// full-screen view owns stdout.
pub fn log_panics() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(%location, %message, "panic");
    }));
}
