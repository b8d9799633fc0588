//! Download, cache, and install a snapshot against a local HTTP host.

mod common;

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{snapshot_host, tar_lz4, Entry};
use valkit_core::integrity::sha256_hex;
use valkit_core::snapshot::{DownloadOptions, ExtractProgressFn, RetryPolicy, SnapshotCache, SnapshotService};
use valkit_core::ErrorCode;

fn service() -> SnapshotService {
    SnapshotService::with_client(
        reqwest::Client::new(),
        RetryPolicy {
            attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            stall_timeout: Duration::from_secs(5),
        },
    )
}

fn chain_snapshot() -> Vec<u8> {
    tar_lz4(&[
        Entry::Dir("data/"),
        Entry::Dir("data/blockstore.db/"),
        Entry::File("data/blockstore.db/000042.ldb", b"blocks", 0o644),
        Entry::File("data/priv_validator_state.json", b"{\"height\":\"1\"}", 0o600),
        Entry::Symlink("data/current", "blockstore.db"),
    ])
}

#[tokio::test]
async fn download_then_reuse_then_install() {
    let archive = chain_snapshot();
    let checksum = sha256_hex(&archive);
    let host = snapshot_host(archive.clone(), &checksum).await;
    let home = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let svc = service();

    let first = svc
        .download(&host.url, home.path(), &DownloadOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(!first.cache_hit);
    assert_eq!(first.checksum, checksum);
    assert_eq!(first.bytes, archive.len() as u64);
    assert_eq!(host.tarball_gets(), 1);

    let second = svc
        .download(&host.url, home.path(), &DownloadOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(second.cache_hit);
    assert_eq!(host.tarball_gets(), 1, "a valid cache must not be fetched again");
    assert!(svc.is_cache_valid(&host.url, home.path()).await.unwrap());

    let forced = svc
        .download(
            &host.url,
            home.path(),
            &DownloadOptions {
                no_cache: true,
                progress: None,
            },
            &cancel,
        )
        .await
        .unwrap();
    assert!(!forced.cache_hit);
    assert_eq!(host.tarball_gets(), 2);

    let data = home.path().join("data");
    fs::create_dir_all(data.join("old.db")).unwrap();
    let signing = br#"{"height":"5021","round":0,"step":3}"#;
    fs::write(data.join("priv_validator_state.json"), signing).unwrap();

    let entries_seen = Arc::new(AtomicU64::new(0));
    let seen = entries_seen.clone();
    let progress: ExtractProgressFn = Box::new(move |done, total, _name| {
        assert_eq!(total, -1);
        seen.store(done, Ordering::SeqCst);
    });
    let report = svc.extract(home.path(), &data, Some(progress)).await.unwrap();

    assert!(report.preserved_signing_state);
    assert_eq!(entries_seen.load(Ordering::SeqCst), report.entries);
    assert!(!data.join("old.db").exists());
    assert_eq!(fs::read(data.join("blockstore.db/000042.ldb")).unwrap(), b"blocks");
    assert_eq!(fs::read(data.join("priv_validator_state.json")).unwrap(), signing);
    assert_eq!(
        fs::read_link(data.join("current")).unwrap(),
        std::path::Path::new("blockstore.db")
    );
}

#[tokio::test]
async fn traversal_archive_leaves_existing_data_alone() {
    let archive = tar_lz4(&[
        Entry::Dir("data/"),
        Entry::File("data/ok.db", b"fine", 0o644),
        Entry::File("data/../../escaped.txt", b"pwned", 0o644),
    ]);
    let host = snapshot_host(archive.clone(), &sha256_hex(&archive)).await;
    let home = tempfile::tempdir().unwrap();
    let svc = service();

    svc.download(&host.url, home.path(), &DownloadOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    let data = home.path().join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("keep.db"), b"mine").unwrap();

    let err = svc.extract(home.path(), &data, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert!(err.message().contains("traversal"), "{}", err.message());

    assert_eq!(fs::read(data.join("keep.db")).unwrap(), b"mine");
    assert!(!home.path().join("escaped.txt").exists());
    assert!(!home.path().parent().unwrap().join("escaped.txt").exists());
}

#[tokio::test]
async fn published_checksum_mismatch_keeps_nothing() {
    let archive = chain_snapshot();
    let host = snapshot_host(archive, &"0".repeat(64)).await;
    let home = tempfile::tempdir().unwrap();

    let err = service()
        .download(&host.url, home.path(), &DownloadOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    let status = SnapshotCache::new(home.path()).status();
    assert!(status.tarball_bytes.is_none());
    assert!(status.stored_checksum.is_none());
}

#[tokio::test]
async fn cancelled_before_start_is_reported_as_cancelled() {
    let archive = chain_snapshot();
    let host = snapshot_host(archive.clone(), &sha256_hex(&archive)).await;
    let home = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = service()
        .download(&host.url, home.path(), &DownloadOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!SnapshotCache::new(home.path()).tarball_path().exists());
}

#[tokio::test]
async fn interrupted_download_resumes_and_installs() {
    let archive = chain_snapshot();
    let checksum = sha256_hex(&archive);
    let host = snapshot_host(archive.clone(), &checksum).await;
    let home = tempfile::tempdir().unwrap();
    let cache = SnapshotCache::new(home.path());
    cache.ensure_dir().unwrap();
    fs::write(cache.partial_path(), &archive[..archive.len() / 2]).unwrap();
    cache.write_partial_marker(&checksum).unwrap();

    let svc = service();
    let outcome = svc
        .download(&host.url, home.path(), &DownloadOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!outcome.cache_hit);
    assert_eq!(host.tarball_gets(), 1);
    assert_eq!(fs::read(cache.tarball_path()).unwrap(), archive);
    assert!(!cache.partial_path().exists());

    let data = home.path().join("data");
    fs::create_dir_all(&data).unwrap();
    svc.extract(home.path(), &data, None).await.unwrap();
    assert_eq!(fs::read(data.join("blockstore.db/000042.ldb")).unwrap(), b"blocks");
}
