//! # Integrity Primitives
//!
//! SHA-256 over files of any size and parsing of `sha256sum`-style manifests
//! (`<64-hex>  <name>`). Comparison is always case-insensitive: publishers
//! disagree on hex casing and we refuse to care.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Streams a file through SHA-256 and returns the lowercase hex digest.
pub fn sha256_of_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    sha256_of_reader(BufReader::with_capacity(256 * 1024, file))
}

/// Hashes everything readable from `reader`.
pub fn sha256_of_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex digest of an in-memory buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// True if `s` is exactly 64 hex characters, either case.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == SHA256_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Returns the digest on the first line whose first whitespace-separated
/// token is a 64-character hex string. Blank lines and `#` comments are
/// skipped, and bytes that are not UTF-8 never form a digest. `None` if no
/// line qualifies.
pub fn parse_checksum_manifest<R: BufRead>(reader: R) -> io::Result<Option<String>> {
    for line in reader.split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(token) = trimmed.split_whitespace().next() {
            if is_sha256_hex(token) {
                return Ok(Some(token.to_string()));
            }
        }
    }
    Ok(None)
}

/// Finds the digest for a named file in a multi-entry manifest such as a
/// release `checksums.txt`. A leading `*` (binary mode marker) on the name
/// is ignored.
pub fn checksum_for_name(manifest: &str, name: &str) -> Option<String> {
    manifest.lines().find_map(|line| {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            return None;
        }
        let mut parts = trimmed.split_whitespace();
        let digest = parts.next()?;
        let file = parts.next()?.trim_start_matches('*');
        (is_sha256_hex(digest) && file == name).then(|| digest.to_string())
    })
}

/// Case-insensitive digest comparison, tolerant of surrounding whitespace.
pub fn checksums_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn hashes_buffers_and_files() {
        assert_eq!(sha256_hex(b"hello"), HELLO);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        assert_eq!(sha256_of_file(file.path()).unwrap(), HELLO);
    }

    #[test]
    fn manifest_accepts_one_or_two_spaces() {
        let two = format!("{HELLO}  latest.tar.lz4\n");
        let one = format!("{HELLO} latest.tar.lz4\n");
        assert_eq!(parse_checksum_manifest(Cursor::new(two)).unwrap().as_deref(), Some(HELLO));
        assert_eq!(parse_checksum_manifest(Cursor::new(one)).unwrap().as_deref(), Some(HELLO));
    }

    #[test]
    fn manifest_skips_comments_blanks_and_junk() {
        let upper = HELLO.to_uppercase();
        let body = format!("# generated nightly\n\nnot-a-digest file\n{upper}  latest.tar.lz4\n");
        assert_eq!(
            parse_checksum_manifest(Cursor::new(body)).unwrap(),
            Some(upper)
        );
    }

    #[test]
    fn manifest_tolerates_non_utf8_bytes() {
        let mut body = vec![0xff, 0xfe, b' ', b'x', b'\n'];
        body.extend_from_slice(format!("{HELLO}  latest.tar.lz4\n").as_bytes());
        assert_eq!(parse_checksum_manifest(Cursor::new(body)).unwrap().as_deref(), Some(HELLO));

        let garbage = vec![0xc3, 0x28, 0xa0, 0xa1, b'\n'];
        assert_eq!(parse_checksum_manifest(Cursor::new(garbage)).unwrap(), None);
    }

    #[test]
    fn manifest_rejects_wrong_lengths() {
        let short = &HELLO[..63];
        let body = format!("{short}  file\n{HELLO}0  file\n");
        assert_eq!(parse_checksum_manifest(Cursor::new(body)).unwrap(), None);
    }

    #[test]
    fn named_lookup_in_release_manifest() {
        let other = "a".repeat(64);
        let manifest = format!(
            "{other}  valkit_1.2.0_darwin_arm64.tar.gz\n{HELLO} *valkit_1.2.0_linux_amd64.tar.gz\n"
        );
        assert_eq!(
            checksum_for_name(&manifest, "valkit_1.2.0_linux_amd64.tar.gz").as_deref(),
            Some(HELLO)
        );
        assert_eq!(checksum_for_name(&manifest, "missing.tar.gz"), None);
    }

    #[test]
    fn comparison_ignores_case() {
        assert!(checksums_match(HELLO, &HELLO.to_uppercase()));
        assert!(checksums_match(&format!("{HELLO}\n"), HELLO));
        assert!(!checksums_match(HELLO, &"0".repeat(64)));
    }
}
