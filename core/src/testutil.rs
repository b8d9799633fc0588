//! Helpers shared by unit tests: in-memory archive builders and a mock HTTP
//! server on an ephemeral port.

use std::io::Write;

use tar::{EntryType, Header};

/// One entry for [`tar_bytes`]. Names and link targets are written into the
/// header verbatim, so hostile names survive the builder's own validation.
pub(crate) struct TarEntry {
    name: String,
    kind: EntryType,
    data: Vec<u8>,
    link: Option<String>,
    mode: u32,
}

impl TarEntry {
    pub(crate) fn file(name: &str, data: &[u8], mode: u32) -> Self {
        Self {
            name: name.into(),
            kind: EntryType::Regular,
            data: data.to_vec(),
            link: None,
            mode,
        }
    }

    pub(crate) fn dir(name: &str, mode: u32) -> Self {
        Self {
            name: name.into(),
            kind: EntryType::Directory,
            data: Vec::new(),
            link: None,
            mode,
        }
    }

    pub(crate) fn symlink(name: &str, target: &str) -> Self {
        Self {
            name: name.into(),
            kind: EntryType::Symlink,
            data: Vec::new(),
            link: Some(target.into()),
            mode: 0o777,
        }
    }

    pub(crate) fn hardlink(name: &str, target: &str) -> Self {
        Self {
            name: name.into(),
            kind: EntryType::Link,
            data: Vec::new(),
            link: Some(target.into()),
            mode: 0o644,
        }
    }

    pub(crate) fn fifo(name: &str) -> Self {
        Self {
            name: name.into(),
            kind: EntryType::Fifo,
            data: Vec::new(),
            link: None,
            mode: 0o644,
        }
    }
}

fn copy_field(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    assert!(bytes.len() < field.len(), "test name too long: {value}");
    field.fill(0);
    field[..bytes.len()].copy_from_slice(bytes);
}

/// Builds an uncompressed tar archive.
pub(crate) fn tar_bytes(entries: &[TarEntry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = Header::new_old();
        copy_field(&mut header.as_old_mut().name, &entry.name);
        if let Some(link) = &entry.link {
            copy_field(&mut header.as_old_mut().linkname, link);
        }
        header.set_entry_type(entry.kind);
        header.set_mode(entry.mode);
        header.set_size(entry.data.len() as u64);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append(&header, &entry.data[..]).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Builds a `tar.lz4` archive (lz4 frame format).
pub(crate) fn tar_lz4(entries: &[TarEntry]) -> Vec<u8> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(&tar_bytes(entries)).unwrap();
    encoder.finish().unwrap()
}

/// Builds a `tar.gz` archive.
pub(crate) fn tar_gz(entries: &[TarEntry]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&tar_bytes(entries)).unwrap();
    encoder.finish().unwrap()
}

/// Serves `router` on `127.0.0.1:<ephemeral>` and returns its base URL.
pub(crate) async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Process runner that records invocations and succeeds without running
/// anything. `output` answers with `stdout`.
#[derive(Default)]
pub(crate) struct RecordingRunner {
    pub(crate) calls: parking_lot::Mutex<Vec<(String, Vec<String>)>>,
    pub(crate) stdout: String,
}

impl RecordingRunner {
    pub(crate) fn with_stdout(stdout: &str) -> Self {
        Self {
            calls: Default::default(),
            stdout: stdout.to_string(),
        }
    }

    /// Argument lists whose first argument is `subcommand`.
    pub(crate) fn invocations_of(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, args)| args.first().map(String::as_str) == Some(subcommand))
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl crate::process::ProcessRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> crate::Result<()> {
        self.calls.lock().push((program.to_string(), args.to_vec()));
        Ok(())
    }

    async fn output(&self, program: &str, args: &[String]) -> crate::Result<String> {
        self.calls.lock().push((program.to_string(), args.to_vec()));
        Ok(self.stdout.clone())
    }
}
