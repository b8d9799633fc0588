//! # Log Tailer
//!
//! Follows a log file into a [`SharedRingBuffer`]:
//!
//! 1. Poll until the file exists.
//! 2. Load the last lines as backlog.
//! 3. Read appended lines from the end; sleep briefly on EOF.
//! 4. Reopen from the start when the file is rotated (new inode) or
//!    truncated (shorter than our offset).
//!
//! Read errors restart the follow loop after a backoff. Cancellation stops
//! the task at any await point.

use std::io::{self, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{LOG_BACKLOG_LINES, LOG_MAX_LINE_BYTES};
use crate::ringbuf::SharedRingBuffer;

/// How far back from the end the backlog scan reads.
const BACKLOG_WINDOW: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailerOptions {
    /// Poll interval while the file does not exist.
    pub wait_interval: Duration,
    /// Sleep after reaching EOF.
    pub eof_sleep: Duration,
    /// Pause before restarting after a read error.
    pub error_backoff: Duration,
    pub backlog_lines: usize,
    /// Longer lines are truncated to this many bytes.
    pub max_line_bytes: usize,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self {
            wait_interval: Duration::from_secs(1),
            eof_sleep: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            backlog_lines: LOG_BACKLOG_LINES,
            max_line_bytes: LOG_MAX_LINE_BYTES,
        }
    }
}

/// Read position in the followed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    inode: Option<u64>,
    offset: u64,
}

#[derive(Debug, Clone)]
pub struct LogTailer {
    path: PathBuf,
    buffer: SharedRingBuffer,
    options: TailerOptions,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, buffer: SharedRingBuffer) -> Self {
        Self {
            path: path.into(),
            buffer,
            options: TailerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TailerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => debug!(path = %self.path.display(), "tailer stopped"),
            _ = self.run_inner() => {}
        }
    }

    async fn run_inner(&self) {
        self.wait_for_file().await;
        let mut cursor = match self.load_backlog().await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not load log backlog");
                Cursor::default()
            }
        };
        loop {
            if let Err(e) = self.follow(&mut cursor).await {
                warn!(path = %self.path.display(), error = %e, "log follow failed, retrying");
                tokio::time::sleep(self.options.error_backoff).await;
            }
            self.wait_for_file().await;
        }
    }

    async fn wait_for_file(&self) {
        while !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tokio::time::sleep(self.options.wait_interval).await;
        }
    }

    /// Pushes the last complete lines and returns the offset just past them.
    async fn load_backlog(&self) -> io::Result<Cursor> {
        let mut file = File::open(&self.path).await?;
        let meta = file.metadata().await?;
        let start = meta.len().saturating_sub(BACKLOG_WINDOW);
        file.seek(SeekFrom::Start(start)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;

        let complete = match bytes.iter().rposition(|&b| b == b'\n') {
            Some(last) => last + 1,
            None => 0,
        };
        let text = String::from_utf8_lossy(&bytes[..complete]);
        let mut lines: Vec<&str> = text.lines().collect();
        if start > 0 && !lines.is_empty() {
            // The window may begin mid-line.
            lines.remove(0);
        }
        let skip = lines.len().saturating_sub(self.options.backlog_lines);
        self.buffer
            .extend(lines[skip..].iter().map(|l| self.clip(l.as_bytes())));

        Ok(Cursor {
            inode: Some(meta.ino()),
            offset: start + complete as u64,
        })
    }

    /// Reads until rotation (`Ok`) or an I/O error.
    async fn follow(&self, cursor: &mut Cursor) -> io::Result<()> {
        let mut file = File::open(&self.path).await?;
        let inode = file.metadata().await?.ino();
        if cursor.inode != Some(inode) {
            cursor.offset = 0;
            cursor.inode = Some(inode);
        }
        file.seek(SeekFrom::Start(cursor.offset)).await?;
        let mut reader = BufReader::new(file);

        let max = self.options.max_line_bytes;
        let mut line = Vec::new();
        let mut discarding = false;
        loop {
            let limit = (max + 1).saturating_sub(line.len()) as u64;
            let n = (&mut reader).take(limit).read_until(b'\n', &mut line).await?;
            cursor.offset += n as u64;

            if n == 0 {
                if self.rotated(cursor).await? {
                    return Ok(());
                }
                tokio::time::sleep(self.options.eof_sleep).await;
                continue;
            }
            if line.ends_with(b"\n") {
                if !discarding {
                    self.buffer.push(self.clip(&line));
                }
                discarding = false;
                line.clear();
            } else if line.len() > max {
                if !discarding {
                    self.buffer.push(self.clip(&line));
                }
                discarding = true;
                line.clear();
            }
        }
    }

    /// True when the path now names a different or shorter file. Resets the
    /// cursor accordingly.
    async fn rotated(&self, cursor: &mut Cursor) -> io::Result<bool> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "log file removed");
                cursor.inode = None;
                cursor.offset = 0;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        if cursor.inode != Some(meta.ino()) {
            debug!(path = %self.path.display(), "log file rotated");
            cursor.inode = None;
            cursor.offset = 0;
            return Ok(true);
        }
        if meta.len() < cursor.offset {
            debug!(path = %self.path.display(), "log file truncated");
            cursor.offset = 0;
            return Ok(true);
        }
        Ok(false)
    }

    fn clip(&self, raw: &[u8]) -> String {
        let raw = &raw[..raw.len().min(self.options.max_line_bytes)];
        String::from_utf8_lossy(raw)
            .trim_end_matches(['\n', '\r'])
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fast() -> TailerOptions {
        TailerOptions {
            wait_interval: Duration::from_millis(20),
            eof_sleep: Duration::from_millis(10),
            error_backoff: Duration::from_millis(20),
            ..TailerOptions::default()
        }
    }

    async fn wait_until(buffer: &SharedRingBuffer, pred: impl Fn(&[String]) -> bool) -> Vec<String> {
        for _ in 0..300 {
            let lines = buffer.get_all();
            if pred(&lines) {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached, buffer: {:?}", buffer.get_all());
    }

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).create(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn loads_backlog_then_follows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let backlog: String = (0..150).map(|i| format!("old {i}\n")).collect();
        std::fs::write(&path, backlog).unwrap();

        let buffer = SharedRingBuffer::new(500);
        let cancel = CancellationToken::new();
        let handle = LogTailer::new(&path, buffer.clone())
            .with_options(fast())
            .spawn(cancel.clone());

        let lines = wait_until(&buffer, |l| l.len() == 100).await;
        assert_eq!(lines[0], "old 50");
        assert_eq!(lines[99], "old 149");

        append(&path, "new 1\nnew");
        append(&path, " 2\n");
        let lines = wait_until(&buffer, |l| l.len() == 102).await;
        assert_eq!(&lines[100..], ["new 1", "new 2"]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn waits_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");
        let buffer = SharedRingBuffer::new(10);
        let cancel = CancellationToken::new();
        let handle = LogTailer::new(&path, buffer.clone())
            .with_options(fast())
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(buffer.is_empty());
        std::fs::write(&path, "hello\n").unwrap();
        wait_until(&buffer, |l| l == ["hello"]).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn survives_rotation_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        std::fs::write(&path, "first\n").unwrap();
        let buffer = SharedRingBuffer::new(50);
        let cancel = CancellationToken::new();
        let handle = LogTailer::new(&path, buffer.clone())
            .with_options(fast())
            .spawn(cancel.clone());
        wait_until(&buffer, |l| l == ["first"]).await;

        std::fs::rename(&path, dir.path().join("node.log.1")).unwrap();
        std::fs::write(&path, "rotated\n").unwrap();
        wait_until(&buffer, |l| l.last().map(String::as_str) == Some("rotated")).await;

        std::fs::write(&path, "").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        append(&path, "after truncate\n");
        wait_until(&buffer, |l| l.last().map(String::as_str) == Some("after truncate")).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_lines_are_clipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        std::fs::write(&path, "").unwrap();
        let buffer = SharedRingBuffer::new(10);
        let cancel = CancellationToken::new();
        let handle = LogTailer::new(&path, buffer.clone())
            .with_options(TailerOptions {
                max_line_bytes: 8,
                ..fast()
            })
            .spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        append(&path, "0123456789abcdef\nshort\n");
        let lines = wait_until(&buffer, |l| l.len() == 2).await;
        assert_eq!(lines, ["01234567", "short"]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
