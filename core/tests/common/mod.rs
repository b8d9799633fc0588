//! Shared fixtures for the integration tests: local HTTP hosts on ephemeral
//! ports, a raw `tar.lz4` builder and a process runner that only records.

#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tar::{EntryType, Header};
use valkit_core::process::ProcessRunner;

pub enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8], u32),
    Symlink(&'a str, &'a str),
}

fn set_field(field: &mut [u8], value: &str) {
    field.fill(0);
    field[..value.len()].copy_from_slice(value.as_bytes());
}

/// Writes names straight into old-style headers so traversal names survive.
pub fn tar_lz4(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = Header::new_old();
        let (name, kind, data, link, mode): (&str, EntryType, &[u8], Option<&str>, u32) = match *entry {
            Entry::Dir(name) => (name, EntryType::Directory, &[][..], None, 0o755),
            Entry::File(name, data, mode) => (name, EntryType::Regular, data, None, mode),
            Entry::Symlink(name, target) => (name, EntryType::Symlink, &[][..], Some(target), 0o777),
        };
        set_field(&mut header.as_old_mut().name, name);
        if let Some(link) = link {
            set_field(&mut header.as_old_mut().linkname, link);
        }
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(data.len() as u64);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

pub struct SnapshotHost {
    pub url: String,
    tarball_gets: Arc<AtomicUsize>,
}

impl SnapshotHost {
    pub fn tarball_gets(&self) -> usize {
        self.tarball_gets.load(Ordering::SeqCst)
    }
}

struct Served {
    tarball: Vec<u8>,
    manifest: String,
    gets: Arc<AtomicUsize>,
}

async fn tarball(State(host): State<Arc<Served>>, method: Method, headers: HeaderMap) -> Response {
    if method == Method::GET {
        host.gets.fetch_add(1, Ordering::SeqCst);
    }
    let start = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());
    match start {
        Some(start) if start >= host.tarball.len() => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        Some(start) => (StatusCode::PARTIAL_CONTENT, host.tarball[start..].to_vec()).into_response(),
        None => host.tarball.clone().into_response(),
    }
}

async fn manifest(State(host): State<Arc<Served>>) -> String {
    host.manifest.clone()
}

/// Publishes `tarball` as `latest.tar.lz4` with a manifest naming `checksum`.
pub async fn snapshot_host(tarball_bytes: Vec<u8>, checksum: &str) -> SnapshotHost {
    let gets = Arc::new(AtomicUsize::new(0));
    let served = Arc::new(Served {
        tarball: tarball_bytes,
        manifest: format!("{checksum}  latest.tar.lz4\n"),
        gets: gets.clone(),
    });
    let router = Router::new()
        .route("/latest.tar.lz4", get(tarball))
        .route("/latest.tar.lz4.sha256", get(manifest))
        .with_state(served);

    SnapshotHost {
        url: serve(router).await,
        tarball_gets: gets,
    }
}

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Records node binary invocations instead of running them.
#[derive(Default)]
pub struct RecordingRunner {
    calls: parking_lot::Mutex<Vec<Vec<String>>>,
}

impl RecordingRunner {
    /// Argument lists whose first argument is `subcommand`.
    pub fn invocations_of(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(subcommand))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl ProcessRunner for RecordingRunner {
    async fn run(&self, _program: &str, args: &[String]) -> valkit_core::Result<()> {
        self.calls.lock().push(args.to_vec());
        Ok(())
    }

    async fn output(&self, _program: &str, args: &[String]) -> valkit_core::Result<String> {
        self.calls.lock().push(args.to_vec());
        Ok(String::new())
    }
}
